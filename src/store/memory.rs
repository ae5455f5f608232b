// src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChangeFeed, PollFeed, PollStore, StoreResult};
use crate::{
    error::StoreError,
    models::{Poll, PollChange, PollId, UserId, Vote},
};

#[derive(Default)]
struct Tables {
    polls: HashMap<PollId, Poll>,
    votes: Vec<Vote>,
}

/// Process-local store with the same constraints as the Postgres schema.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    feed: ChangeFeed,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

fn newest_first(mut polls: Vec<Poll>) -> Vec<Poll> {
    polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    polls
}

#[async_trait]
impl PollStore for InMemoryStore {
    async fn insert_poll(&self, poll: &Poll) -> StoreResult<Poll> {
        if poll.options.len() < crate::models::MIN_OPTIONS {
            return Err(StoreError::Unavailable(
                "check constraint: poll needs at least two options".into(),
            ));
        }
        self.tables.lock().polls.insert(poll.id, poll.clone());
        Ok(poll.clone())
    }

    async fn find_poll(&self, poll_id: PollId) -> StoreResult<Option<Poll>> {
        Ok(self.tables.lock().polls.get(&poll_id).cloned())
    }

    async fn delete_poll(&self, poll_id: PollId) -> StoreResult<bool> {
        {
            let mut tables = self.tables.lock();
            if tables.polls.remove(&poll_id).is_none() {
                return Ok(false);
            }
            tables.votes.retain(|vote| vote.poll_id != poll_id);
        }

        self.feed.dispatch(&PollChange::PollDeleted { poll_id });
        Ok(true)
    }

    async fn list_public_polls(&self, limit: i64) -> StoreResult<Vec<Poll>> {
        let polls = self
            .tables
            .lock()
            .polls
            .values()
            .filter(|poll| poll.is_public)
            .cloned()
            .collect();
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(newest_first(polls).into_iter().take(limit).collect())
    }

    async fn list_polls_by_owner(&self, owner_id: UserId) -> StoreResult<Vec<Poll>> {
        let polls = self
            .tables
            .lock()
            .polls
            .values()
            .filter(|poll| poll.owner_id == owner_id)
            .cloned()
            .collect();
        Ok(newest_first(polls))
    }

    async fn find_vote(&self, poll_id: PollId, voter_id: UserId) -> StoreResult<Option<Vote>> {
        Ok(self
            .tables
            .lock()
            .votes
            .iter()
            .find(|vote| vote.poll_id == poll_id && vote.voter_id == voter_id)
            .cloned())
    }

    async fn insert_vote(&self, vote: &Vote) -> StoreResult<Vote> {
        {
            let mut tables = self.tables.lock();
            if !tables.polls.contains_key(&vote.poll_id) {
                return Err(StoreError::PollMissing);
            }
            if vote.option_index < 0 {
                return Err(StoreError::Unavailable(
                    "check constraint: option_index must be non-negative".into(),
                ));
            }
            // unique (poll_id, voter_id), checked under the same lock as the insert
            if tables
                .votes
                .iter()
                .any(|v| v.poll_id == vote.poll_id && v.voter_id == vote.voter_id)
            {
                return Err(StoreError::DuplicateVote);
            }
            tables.votes.push(vote.clone());
        }

        self.feed.dispatch(&PollChange::from(vote));
        Ok(vote.clone())
    }

    async fn list_votes(&self, poll_id: PollId) -> StoreResult<Vec<Vote>> {
        Ok(self
            .tables
            .lock()
            .votes
            .iter()
            .filter(|vote| vote.poll_id == poll_id)
            .cloned()
            .collect())
    }

    async fn subscribe_changes(&self, poll_id: PollId) -> StoreResult<PollFeed> {
        Ok(self.feed.subscribe(poll_id))
    }
}
