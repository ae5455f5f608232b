// src/state.rs
use std::sync::Arc;

use axum::extract::FromRef;

use crate::{
    identity::{HeaderIdentity, IdentityProvider},
    poll::VotingService,
    store::PollStore,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub voting: VotingService,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(store: Arc<dyn PollStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            voting: VotingService::new(store),
            identity,
        }
    }

    /// State backed by the given store, trusting the default identity header.
    pub fn with_store(store: Arc<dyn PollStore>) -> Self {
        Self::new(store, Arc::new(HeaderIdentity::default()))
    }
}
