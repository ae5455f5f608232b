// src/identity.rs
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use http::request::Parts;
use tracing::debug;
use uuid::Uuid;

use crate::{error::ApiError, models::UserId};

pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
}

/// Resolves the caller. Authentication happens upstream.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// The authenticated user behind the request, if any.
    async fn current_user(&self, parts: &Parts) -> Option<AuthUser>;
}

/// Trusts a header carrying the user's UUID, as set by an authenticating proxy.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: String,
}

impl HeaderIdentity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_HEADER)
    }
}

#[async_trait]
impl IdentityProvider for HeaderIdentity {
    async fn current_user(&self, parts: &Parts) -> Option<AuthUser> {
        let value = parts.headers.get(self.header.as_str())?.to_str().ok()?;
        match Uuid::parse_str(value.trim()) {
            Ok(id) => Some(AuthUser { id }),
            Err(e) => {
                debug!("ignoring malformed {} header: {e}", self.header);
                None
            }
        }
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<dyn IdentityProvider>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let identity = Arc::<dyn IdentityProvider>::from_ref(state);
        identity
            .current_user(parts)
            .await
            .ok_or(ApiError::Unauthenticated)
    }
}
