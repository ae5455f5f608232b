// src/poll.rs
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{StoreError, VoteError},
    models::{
        NewPoll, Poll, PollId, PollResults, Tally, UserId, Vote, MAX_OPTIONS, MAX_OPTION_LEN,
        MAX_QUESTION_LEN, MIN_OPTIONS,
    },
    store::{PollFeed, PollStore},
};

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

/// Vote submission, tallies and live tally subscriptions.
///
/// The duplicate pre-check only gives a friendly early error. The store's
/// `(poll_id, voter_id)` constraint decides between racing submissions.
#[derive(Clone)]
pub struct VotingService {
    store: Arc<dyn PollStore>,
}

impl VotingService {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn submit_vote(
        &self,
        poll_id: PollId,
        voter_id: UserId,
        option_index: i32,
    ) -> Result<Vote, VoteError> {
        if self.store.find_vote(poll_id, voter_id).await?.is_some() {
            debug!("voter already has a vote on this poll");
            return Err(VoteError::AlreadyVoted);
        }

        let poll = self
            .store
            .find_poll(poll_id)
            .await?
            .ok_or(VoteError::PollNotFound)?;

        if poll.is_expired_at(Utc::now()) {
            return Err(VoteError::PollExpired);
        }

        if !poll.has_option(option_index) {
            return Err(VoteError::InvalidOption {
                index: option_index,
                option_count: poll.option_count(),
            });
        }

        match self
            .store
            .insert_vote(&Vote::new(poll_id, voter_id, option_index))
            .await
        {
            Ok(vote) => {
                info!(vote_id = %vote.id, "vote recorded");
                Ok(vote)
            }
            Err(StoreError::DuplicateVote) => {
                debug!("lost insert race to a concurrent vote");
                Err(VoteError::AlreadyVoted)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn compute_tally(&self, poll_id: PollId) -> Result<Tally, VoteError> {
        compute_tally(self.store.as_ref(), poll_id).await
    }

    /// Absence of a vote is `false`, whether or not the poll exists.
    pub async fn has_voted(&self, poll_id: PollId, voter_id: UserId) -> Result<bool, VoteError> {
        Ok(self.store.find_vote(poll_id, voter_id).await?.is_some())
    }

    /// Recomputes the tally on every change to the poll and hands it to `on_update`.
    ///
    /// The subscription is registered before this returns, so any vote recorded
    /// afterwards is observed. There is no initial emission. If a recomputation
    /// fails (for instance because the poll was deleted) `on_update` receives the
    /// error once and the subscription ends.
    pub async fn subscribe_to_tally<F>(
        &self,
        poll_id: PollId,
        on_update: F,
    ) -> Result<TallySubscription, VoteError>
    where
        F: FnMut(Result<Tally, VoteError>) + Send + 'static,
    {
        if self.store.find_poll(poll_id).await?.is_none() {
            return Err(VoteError::PollNotFound);
        }

        let feed = self.store.subscribe_changes(poll_id).await?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let task = tokio::spawn(run_subscription(
            self.store.clone(),
            feed,
            on_update,
            cancelled.clone(),
            wake.clone(),
        ));
        debug!(%poll_id, "tally subscription started");

        Ok(TallySubscription {
            poll_id,
            cancelled,
            wake,
            task,
        })
    }

    pub async fn create_poll(&self, owner_id: UserId, new_poll: NewPoll) -> Result<Poll, VoteError> {
        let now = Utc::now();
        let (question, options) = validate_new_poll(&new_poll)?;
        if new_poll.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(VoteError::InvalidPoll(
                "expiration must be in the future".into(),
            ));
        }

        let poll = Poll {
            id: Uuid::new_v4(),
            owner_id,
            question,
            options,
            expires_at: new_poll.expires_at,
            is_public: new_poll.is_public,
            created_at: now,
        };

        let poll = self.store.insert_poll(&poll).await?;
        info!(poll_id = %poll.id, %owner_id, options = poll.option_count(), "poll created");
        Ok(poll)
    }

    pub async fn get_poll(&self, poll_id: PollId) -> Result<Poll, VoteError> {
        self.store
            .find_poll(poll_id)
            .await?
            .ok_or(VoteError::PollNotFound)
    }

    pub async fn list_public_polls(&self, limit: Option<i64>) -> Result<Vec<Poll>, VoteError> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_public_polls(limit).await?)
    }

    pub async fn list_polls_by_owner(&self, owner_id: UserId) -> Result<Vec<Poll>, VoteError> {
        Ok(self.store.list_polls_by_owner(owner_id).await?)
    }

    /// Deletes a poll and its votes. Only the owner may do this.
    pub async fn delete_poll(&self, poll_id: PollId, requester_id: UserId) -> Result<(), VoteError> {
        let poll = self.get_poll(poll_id).await?;
        if poll.owner_id != requester_id {
            warn!(%poll_id, %requester_id, "rejected delete by non-owner");
            return Err(VoteError::NotPollOwner);
        }

        if !self.store.delete_poll(poll_id).await? {
            return Err(VoteError::PollNotFound);
        }
        info!(%poll_id, "poll deleted");
        Ok(())
    }

    pub async fn poll_results(&self, poll_id: PollId) -> Result<PollResults, VoteError> {
        let poll = self.get_poll(poll_id).await?;
        let votes = self.store.list_votes(poll_id).await?;
        let tally = tally_votes(poll.option_count(), &votes);
        Ok(PollResults::new(poll, &tally, Utc::now()))
    }
}

async fn compute_tally(store: &dyn PollStore, poll_id: PollId) -> Result<Tally, VoteError> {
    let poll = store
        .find_poll(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)?;
    let votes = store.list_votes(poll_id).await?;
    Ok(tally_votes(poll.option_count(), &votes))
}

/// Buckets votes by option index. Indices outside `0..option_count` are skipped.
pub fn tally_votes(option_count: usize, votes: &[Vote]) -> Tally {
    let mut tally = vec![0; option_count];
    for vote in votes {
        match usize::try_from(vote.option_index)
            .ok()
            .and_then(|index| tally.get_mut(index))
        {
            Some(count) => *count += 1,
            None => warn!(
                vote_id = %vote.id,
                option_index = vote.option_index,
                option_count,
                "skipping vote with out-of-range option"
            ),
        }
    }
    tally
}

fn validate_new_poll(new_poll: &NewPoll) -> Result<(String, Vec<String>), VoteError> {
    let question = new_poll.question.trim();
    if question.is_empty() {
        return Err(VoteError::InvalidPoll("question must not be empty".into()));
    }
    if question.chars().count() > MAX_QUESTION_LEN {
        return Err(VoteError::InvalidPoll(format!(
            "question must be at most {MAX_QUESTION_LEN} characters"
        )));
    }

    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&new_poll.options.len()) {
        return Err(VoteError::InvalidPoll(format!(
            "a poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} options"
        )));
    }

    let options = new_poll
        .options
        .iter()
        .map(|option| {
            let option = option.trim();
            if option.is_empty() {
                Err(VoteError::InvalidPoll("options must not be empty".into()))
            } else if option.chars().count() > MAX_OPTION_LEN {
                Err(VoteError::InvalidPoll(format!(
                    "options must be at most {MAX_OPTION_LEN} characters"
                )))
            } else {
                Ok(option.to_string())
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((question.to_string(), options))
}

async fn run_subscription<F>(
    store: Arc<dyn PollStore>,
    mut feed: PollFeed,
    mut on_update: F,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
) where
    F: FnMut(Result<Tally, VoteError>) + Send + 'static,
{
    let poll_id = feed.poll_id();
    loop {
        tokio::select! {
            biased;
            _ = wake.notified() => break,
            change = feed.recv() => {
                if change.is_none() {
                    warn!(%poll_id, "change feed closed, ending tally subscription");
                    if !cancelled.load(Ordering::Acquire) {
                        on_update(Err(VoteError::StoreUnavailable("change feed closed".into())));
                    }
                    break;
                }

                let result = compute_tally(store.as_ref(), poll_id).await;
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                match result {
                    Ok(tally) => on_update(Ok(tally)),
                    Err(e) => {
                        warn!(%poll_id, "tally recomputation failed, ending subscription: {e}");
                        on_update(Err(e));
                        break;
                    }
                }
            }
        }
    }
    drop(feed);
    debug!(%poll_id, "tally subscription finished");
}

/// Handle to a live tally subscription. Dropping it cancels the subscription.
pub struct TallySubscription {
    poll_id: PollId,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TallySubscription {
    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    /// Stops further callbacks and releases the change feed. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `false` once the subscription has ended, by cancellation or by error.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Waits for the subscription task to end.
    pub async fn finished(&mut self) {
        if self.task.is_finished() {
            return;
        }
        if let Err(e) = (&mut self.task).await {
            warn!(poll_id = %self.poll_id, "tally subscription task failed: {e}");
        }
    }
}

impl Drop for TallySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_poll(question: &str, options: &[&str]) -> NewPoll {
        NewPoll {
            question: question.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            expires_at: None,
            is_public: true,
        }
    }

    #[test]
    fn tally_counts_per_option() {
        let poll_id = Uuid::new_v4();
        let votes: Vec<Vote> = [0, 2, 2, 1, 2]
            .into_iter()
            .map(|index| Vote::new(poll_id, Uuid::new_v4(), index))
            .collect();

        let tally = tally_votes(4, &votes);
        assert_eq!(tally, vec![1, 1, 3, 0]);
        assert_eq!(tally.iter().sum::<u64>(), votes.len() as u64);
    }

    #[test]
    fn tally_of_no_votes_is_all_zero() {
        assert_eq!(tally_votes(3, &[]), vec![0, 0, 0]);
    }

    #[test]
    fn tally_skips_out_of_range_votes() {
        let poll_id = Uuid::new_v4();
        let votes = vec![
            Vote::new(poll_id, Uuid::new_v4(), 5),
            Vote::new(poll_id, Uuid::new_v4(), -1),
            Vote::new(poll_id, Uuid::new_v4(), 1),
        ];
        assert_eq!(tally_votes(2, &votes), vec![0, 1]);
    }

    #[test]
    fn validation_trims_question_and_options() {
        let (question, options) =
            validate_new_poll(&new_poll("  Tabs or spaces? ", &[" Tabs", "Spaces  "])).unwrap();
        assert_eq!(question, "Tabs or spaces?");
        assert_eq!(options, vec!["Tabs", "Spaces"]);
    }

    #[test]
    fn validation_rejects_bad_polls() {
        let cases = [
            new_poll("   ", &["a", "b"]),
            new_poll("Q", &["only one"]),
            new_poll("Q", &["a", "  "]),
            new_poll(&"x".repeat(MAX_QUESTION_LEN + 1), &["a", "b"]),
            new_poll("Q", &vec!["opt"; MAX_OPTIONS + 1]),
        ];
        for case in cases {
            assert!(
                matches!(validate_new_poll(&case), Err(VoteError::InvalidPoll(_))),
                "{case:?} should be rejected"
            );
        }
    }
}
