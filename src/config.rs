// src/config.rs
use std::{env, fmt::Display, net::IpAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

use crate::identity::DEFAULT_IDENTITY_HEADER;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub identity_header: String,
    pub cors_allowed_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so it can be tested without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            bind_address: parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0")?,
            port: parse_or(&lookup, "PORT", "3030")?,
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", "5")?,
            acquire_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                "5",
            )?),
            identity_header: lookup("IDENTITY_HEADER")
                .unwrap_or_else(|| DEFAULT_IDENTITY_HEADER.to_string())
                .to_ascii_lowercase(),
            cors_allowed_origin: lookup("CORS_ALLOWED_ORIGIN").filter(|origin| !origin.is_empty()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}
