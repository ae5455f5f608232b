// src/store/mod.rs
pub mod memory;
pub mod postgres;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    error::StoreError,
    models::{Poll, PollChange, PollId, UserId, Vote},
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for polls and votes. Implementations enforce one vote per
/// `(poll_id, voter_id)` and report violations as [`StoreError::DuplicateVote`].
#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    async fn insert_poll(&self, poll: &Poll) -> StoreResult<Poll>;

    async fn find_poll(&self, poll_id: PollId) -> StoreResult<Option<Poll>>;

    /// Deletes the poll and, by cascade, all of its votes. Returns `false` if no poll matched.
    async fn delete_poll(&self, poll_id: PollId) -> StoreResult<bool>;

    /// Public polls, newest first.
    async fn list_public_polls(&self, limit: i64) -> StoreResult<Vec<Poll>>;

    async fn list_polls_by_owner(&self, owner_id: UserId) -> StoreResult<Vec<Poll>>;

    async fn find_vote(&self, poll_id: PollId, voter_id: UserId) -> StoreResult<Option<Vote>>;

    /// Inserts a vote, failing with [`StoreError::DuplicateVote`] if the voter already voted.
    async fn insert_vote(&self, vote: &Vote) -> StoreResult<Vote>;

    async fn list_votes(&self, poll_id: PollId) -> StoreResult<Vec<Vote>>;

    /// Registers for change notifications on the poll: vote inserts and the poll's deletion.
    ///
    /// The registration is live once this returns.
    async fn subscribe_changes(&self, poll_id: PollId) -> StoreResult<PollFeed>;
}

type Subscribers = HashMap<PollId, Vec<(u64, mpsc::UnboundedSender<PollChange>)>>;

#[derive(Default)]
struct FeedInner {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

/// In-process fan-out of poll change notifications, keyed by poll.
#[derive(Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, poll_id: PollId) -> PollFeed {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .entry(poll_id)
            .or_default()
            .push((id, tx));
        trace!(%poll_id, subscription = id, "change feed registered");

        PollFeed {
            poll_id,
            id,
            rx,
            feed: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers the event to every live subscriber of its poll, pruning closed ones.
    pub fn dispatch(&self, event: &PollChange) {
        let poll_id = event.poll_id();
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(&poll_id) {
            senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(&poll_id);
            }
        }
    }

    /// Sends a [`PollChange::Resync`] to every poll with live subscribers and
    /// returns how many polls were notified.
    pub fn resync_all(&self) -> usize {
        let poll_ids: Vec<PollId> = self.inner.subscribers.lock().keys().copied().collect();
        for poll_id in &poll_ids {
            self.dispatch(&PollChange::Resync { poll_id: *poll_id });
        }
        poll_ids.len()
    }

    pub fn subscriber_count(&self, poll_id: PollId) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(&poll_id)
            .map_or(0, Vec::len)
    }
}

/// Receiving end of a poll's change notifications. Dropping it releases the registration.
pub struct PollFeed {
    poll_id: PollId,
    id: u64,
    rx: mpsc::UnboundedReceiver<PollChange>,
    feed: Weak<FeedInner>,
}

impl PollFeed {
    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    /// Waits for the next change. `None` once the backing store has gone away.
    pub async fn recv(&mut self) -> Option<PollChange> {
        self.rx.recv().await
    }

    /// Releases the registration. Same as dropping the feed.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for PollFeed {
    fn drop(&mut self) {
        let Some(inner) = self.feed.upgrade() else {
            return;
        };
        let mut subscribers = inner.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(&self.poll_id) {
            senders.retain(|(id, _)| *id != self.id);
            if senders.is_empty() {
                subscribers.remove(&self.poll_id);
            }
        }
        trace!(poll_id = %self.poll_id, subscription = self.id, "change feed released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(poll_id: PollId) -> PollChange {
        PollChange::VoteInserted {
            vote_id: Uuid::new_v4(),
            poll_id,
            option_index: 0,
        }
    }

    #[tokio::test]
    async fn dispatch_is_scoped_to_poll() {
        let feed = ChangeFeed::new();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut sub = feed.subscribe(watched);

        feed.dispatch(&event(other));
        feed.dispatch(&event(watched));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.poll_id(), watched);
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let feed = ChangeFeed::new();
        let poll_id = Uuid::new_v4();
        let mut first = feed.subscribe(poll_id);
        let mut second = feed.subscribe(poll_id);

        feed.dispatch(&event(poll_id));

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());
    }

    #[test]
    fn dropping_the_feed_releases_the_registration() {
        let feed = ChangeFeed::new();
        let poll_id = Uuid::new_v4();
        let first = feed.subscribe(poll_id);
        let second = feed.subscribe(poll_id);
        assert_eq!(feed.subscriber_count(poll_id), 2);

        first.unsubscribe();
        assert_eq!(feed.subscriber_count(poll_id), 1);
        drop(second);
        assert_eq!(feed.subscriber_count(poll_id), 0);
    }

    #[tokio::test]
    async fn resync_reaches_every_watched_poll() {
        let feed = ChangeFeed::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut first = feed.subscribe(a);
        let mut second = feed.subscribe(a);
        let mut third = feed.subscribe(b);

        assert_eq!(feed.resync_all(), 2);

        assert_eq!(first.recv().await, Some(PollChange::Resync { poll_id: a }));
        assert_eq!(second.recv().await, Some(PollChange::Resync { poll_id: a }));
        assert_eq!(third.recv().await, Some(PollChange::Resync { poll_id: b }));
    }

    #[test]
    fn resync_without_subscribers_is_a_no_op() {
        assert_eq!(ChangeFeed::new().resync_all(), 0);
    }
}
