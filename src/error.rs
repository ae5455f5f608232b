// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures reported by a [`crate::store::PollStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The `(poll_id, voter_id)` uniqueness constraint rejected an insert.
    #[error("duplicate vote for poll and voter")]
    DuplicateVote,

    /// A vote referenced a poll that no longer exists.
    #[error("referenced poll does not exist")]
    PollMissing,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            StoreError::DuplicateVote
        } else if is_foreign_key_violation(&err) {
            StoreError::PollMissing
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Postgres reports unique constraint violations with SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

/// SQLSTATE 23503: the referenced poll row is gone.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23503")
}

fn has_sqlstate(err: &sqlx::Error, sqlstate: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().is_some_and(|code| code == sqlstate);
    }
    false
}

/// Outcomes of the voting service that callers must handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("poll not found")]
    PollNotFound,

    #[error("poll has expired")]
    PollExpired,

    #[error("option {index} is out of range for a poll with {option_count} options")]
    InvalidOption { index: i32, option_count: usize },

    #[error("already voted on this poll")]
    AlreadyVoted,

    #[error("invalid poll: {0}")]
    InvalidPoll(String),

    #[error("only the poll owner may do this")]
    NotPollOwner,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl VoteError {
    /// Only storage failures are worth retrying with the same arguments.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoteError::StoreUnavailable(_))
    }
}

impl From<StoreError> for VoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateVote => VoteError::AlreadyVoted,
            StoreError::PollMissing => VoteError::PollNotFound,
            StoreError::Unavailable(reason) => VoteError::StoreUnavailable(reason),
        }
    }
}

/// Error type returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,

    #[error(transparent)]
    Vote(#[from] VoteError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Vote(err) => match err {
                VoteError::PollNotFound => StatusCode::NOT_FOUND,
                VoteError::PollExpired | VoteError::AlreadyVoted => StatusCode::CONFLICT,
                VoteError::InvalidOption { .. } | VoteError::InvalidPoll(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                VoteError::NotPollOwner => StatusCode::FORBIDDEN,
                VoteError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Vote(VoteError::StoreUnavailable(reason)) => {
                error!("store unavailable: {reason}");
                "Service temporarily unavailable, please try again".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_checks_detect_only_db_codes() {
        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
        assert!(!is_foreign_key_violation(&err));
        assert_eq!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(sqlx::Error::PoolTimedOut.to_string())
        );
    }

    #[test]
    fn duplicate_constraint_maps_to_already_voted() {
        assert_eq!(
            VoteError::from(StoreError::DuplicateVote),
            VoteError::AlreadyVoted
        );
    }

    #[test]
    fn missing_poll_on_insert_is_terminal() {
        let err = VoteError::from(StoreError::PollMissing);
        assert_eq!(err, VoteError::PollNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(VoteError::StoreUnavailable("down".into()).is_retryable());
        for err in [
            VoteError::PollNotFound,
            VoteError::PollExpired,
            VoteError::AlreadyVoted,
            VoteError::InvalidOption {
                index: 3,
                option_count: 2,
            },
        ] {
            assert!(!err.is_retryable(), "{err} must be terminal");
        }
    }

    #[test]
    fn status_mapping() {
        let status = |err: VoteError| ApiError::from(err).status();
        assert_eq!(status(VoteError::PollNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(VoteError::AlreadyVoted), StatusCode::CONFLICT);
        assert_eq!(status(VoteError::PollExpired), StatusCode::CONFLICT);
        assert_eq!(status(VoteError::NotPollOwner), StatusCode::FORBIDDEN);
        assert_eq!(
            status(VoteError::StoreUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }
}
