// src/lib.rs
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod poll;
pub mod routes;
pub mod state;
pub mod store;

pub use error::{ApiError, StoreError, VoteError};
pub use poll::{TallySubscription, VotingService};
pub use state::AppState;
pub use store::{InMemoryStore, PgStore, PollStore};
