// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PollId = Uuid;
pub type UserId = Uuid;

/// Per-option vote counts, indexed like `Poll::options`.
pub type Tally = Vec<u64>;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 20;
pub const MAX_QUESTION_LEN: usize = 500;
pub const MAX_OPTION_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: PollId,
    pub owner_id: UserId,
    pub question: String,
    pub options: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    /// A poll expires strictly after `expires_at`; voting at the exact instant is still allowed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    pub fn has_option(&self, index: i32) -> bool {
        usize::try_from(index).is_ok_and(|index| index < self.option_count())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: Uuid,
    pub poll_id: PollId,
    pub voter_id: UserId,
    pub option_index: i32,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(poll_id: PollId, voter_id: UserId, option_index: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            poll_id,
            voter_id,
            option_index,
            created_at: Utc::now(),
        }
    }
}

/// Payload for creating a poll. Validation happens in the voting service.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_public")]
    pub is_public: bool,
}

fn default_public() -> bool {
    true
}

/// Change notification emitted by the store for a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollChange {
    VoteInserted {
        vote_id: Uuid,
        poll_id: PollId,
        option_index: i32,
    },
    PollDeleted {
        poll_id: PollId,
    },
    /// Notifications may have been missed; re-read the poll.
    Resync {
        poll_id: PollId,
    },
}

impl PollChange {
    pub fn poll_id(&self) -> PollId {
        match self {
            PollChange::VoteInserted { poll_id, .. }
            | PollChange::PollDeleted { poll_id }
            | PollChange::Resync { poll_id } => *poll_id,
        }
    }
}

impl From<&Vote> for PollChange {
    fn from(vote: &Vote) -> Self {
        PollChange::VoteInserted {
            vote_id: vote.id,
            poll_id: vote.poll_id,
            option_index: vote.option_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionResult {
    pub index: usize,
    pub label: String,
    pub votes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResults {
    pub poll_id: PollId,
    pub question: String,
    pub options: Vec<OptionResult>,
    pub total_votes: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

impl PollResults {
    pub fn new(poll: Poll, tally: &[u64], now: DateTime<Utc>) -> Self {
        let is_expired = poll.is_expired_at(now);
        let options = poll
            .options
            .into_iter()
            .enumerate()
            .map(|(index, label)| OptionResult {
                index,
                label,
                votes: tally.get(index).copied().unwrap_or(0),
            })
            .collect();

        Self {
            poll_id: poll.id,
            question: poll.question,
            options,
            total_votes: tally.iter().sum(),
            expires_at: poll.expires_at,
            is_expired,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option_index: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HasVotedResponse {
    pub has_voted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TallyEvent {
    pub poll_id: PollId,
    pub tally: Tally,
}
