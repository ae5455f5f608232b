// src/store/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChangeFeed, PollFeed, PollStore, StoreResult};
use crate::models::{Poll, PollChange, PollId, UserId, Vote};

pub const CHANGE_CHANNEL: &str = "poll_changes";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

const POLL_COLUMNS: &str = "id, owner_id, question, options, expires_at, is_public, created_at";
const VOTE_COLUMNS: &str = "id, poll_id, voter_id, option_index, created_at";

/// Triggers publish each [`PollChange`] as JSON on [`CHANGE_CHANNEL`]; one
/// `LISTEN` task per store forwards them into the in-process [`ChangeFeed`].
pub struct PgStore {
    pool: PgPool,
    feed: ChangeFeed,
    listener: JoinHandle<()>,
}

impl PgStore {
    /// Wraps the pool and starts listening for change notifications.
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let listener = listen(&pool).await?;
        info!("Listening for poll changes on channel {CHANGE_CHANNEL}");

        let feed = ChangeFeed::new();
        let listener = tokio::spawn(forward_notifications(
            pool.clone(),
            listener,
            feed.clone(),
        ));

        Ok(Self {
            pool,
            feed,
            listener,
        })
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    Ok(listener)
}

async fn forward_notifications(pool: PgPool, mut listener: PgListener, feed: ChangeFeed) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => match parse_notification(notification.payload()) {
                Some(change) => {
                    debug!(poll_id = %change.poll_id(), ?change, "poll change notification");
                    feed.dispatch(&change);
                }
                None => warn!(
                    "Ignoring malformed {CHANGE_CHANNEL} payload: {}",
                    notification.payload()
                ),
            },
            Ok(None) => {
                warn!("Poll change listener lost its connection");
                listener = relisten(&pool, &feed).await;
            }
            Err(e) => {
                error!("Poll change listener error: {e}");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                listener = relisten(&pool, &feed).await;
            }
        }
    }
}

/// Opens a fresh listener, then tells every live subscriber to recompute.
/// Changes committed before `LISTEN` took effect are covered by the resync;
/// later ones arrive as notifications.
async fn relisten(pool: &PgPool, feed: &ChangeFeed) -> PgListener {
    let listener = loop {
        match listen(pool).await {
            Ok(listener) => break listener,
            Err(e) => {
                error!("Failed to re-listen on {CHANGE_CHANNEL}: {e}");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        }
    };
    let polls = feed.resync_all();
    info!(polls, "Poll change listener reconnected, resynced live subscriptions");
    listener
}

pub(crate) fn parse_notification(payload: &str) -> Option<PollChange> {
    serde_json::from_str(payload).ok()
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_poll(&self, poll: &Poll) -> StoreResult<Poll> {
        let query = format!(
            "INSERT INTO polls ({POLL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {POLL_COLUMNS}"
        );
        let poll = sqlx::query_as::<_, Poll>(&query)
            .bind(poll.id)
            .bind(poll.owner_id)
            .bind(&poll.question)
            .bind(&poll.options)
            .bind(poll.expires_at)
            .bind(poll.is_public)
            .bind(poll.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(poll)
    }

    async fn find_poll(&self, poll_id: PollId) -> StoreResult<Option<Poll>> {
        let query = format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = $1");
        let poll = sqlx::query_as::<_, Poll>(&query)
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(poll)
    }

    async fn delete_poll(&self, poll_id: PollId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_public_polls(&self, limit: i64) -> StoreResult<Vec<Poll>> {
        let query = format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE is_public ORDER BY created_at DESC LIMIT $1"
        );
        let polls = sqlx::query_as::<_, Poll>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(polls)
    }

    async fn list_polls_by_owner(&self, owner_id: UserId) -> StoreResult<Vec<Poll>> {
        let query = format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE owner_id = $1 ORDER BY created_at DESC"
        );
        let polls = sqlx::query_as::<_, Poll>(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(polls)
    }

    async fn find_vote(&self, poll_id: PollId, voter_id: UserId) -> StoreResult<Option<Vote>> {
        let query = format!("SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1 AND voter_id = $2");
        let vote = sqlx::query_as::<_, Vote>(&query)
            .bind(poll_id)
            .bind(voter_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(vote)
    }

    async fn insert_vote(&self, vote: &Vote) -> StoreResult<Vote> {
        let query = format!(
            "INSERT INTO votes ({VOTE_COLUMNS}) VALUES ($1, $2, $3, $4, $5) RETURNING {VOTE_COLUMNS}"
        );
        let vote = sqlx::query_as::<_, Vote>(&query)
            .bind(vote.id)
            .bind(vote.poll_id)
            .bind(vote.voter_id)
            .bind(vote.option_index)
            .bind(vote.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(vote)
    }

    async fn list_votes(&self, poll_id: PollId) -> StoreResult<Vec<Vote>> {
        let query = format!("SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1");
        let votes = sqlx::query_as::<_, Vote>(&query)
            .bind(poll_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(votes)
    }

    async fn subscribe_changes(&self, poll_id: PollId) -> StoreResult<PollFeed> {
        Ok(self.feed.subscribe(poll_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parses_vote_trigger_payload() {
        let poll_id = Uuid::new_v4();
        let vote_id = Uuid::new_v4();
        let payload = format!(
            r#"{{"kind":"vote_inserted","vote_id":"{vote_id}","poll_id":"{poll_id}","option_index":1}}"#
        );

        assert_eq!(
            parse_notification(&payload),
            Some(PollChange::VoteInserted {
                vote_id,
                poll_id,
                option_index: 1,
            })
        );
    }

    #[test]
    fn parses_delete_trigger_payload() {
        let poll_id = Uuid::new_v4();
        let payload = format!(r#"{{"kind":"poll_deleted","poll_id":"{poll_id}"}}"#);

        assert_eq!(
            parse_notification(&payload),
            Some(PollChange::PollDeleted { poll_id })
        );
    }

    #[test]
    fn parses_resync_payload() {
        let poll_id = Uuid::new_v4();
        let payload = format!(r#"{{"kind":"resync","poll_id":"{poll_id}"}}"#);

        assert_eq!(
            parse_notification(&payload),
            Some(PollChange::Resync { poll_id })
        );
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_notification("not json").is_none());
        assert!(parse_notification(r#"{"kind":"poll_deleted","poll_id":"nope"}"#).is_none());
        assert!(parse_notification(r#"{"kind":"renamed","poll_id":"nope"}"#).is_none());
    }
}
