//! Core data model.
//!
//! A record is one persisted unit of work. It carries an opaque payload that
//! only the queue's handler interprets, plus the lifecycle bookkeeping the
//! engine needs to hand it to exactly one owner at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A unit of work tracked by a record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within its queue, assigned by the store.
    pub id: RecordId,

    /// Queue this record belongs to.
    pub queue: String,

    /// Current lifecycle state.
    pub state: State,

    /// Optional partition tag. Claim filters match on it.
    pub tag: Option<String>,

    /// Business data. The engine never interprets it.
    pub payload: serde_json::Value,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// The record is invisible to claims until this instant.
    pub process_after: Option<DateTime<Utc>>,

    /// Times the stalled-record resetter returned this record to the queue.
    pub num_resets: u32,

    /// Failed execution attempts so far.
    pub num_failures: u32,

    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Identity of the current (or, for finished records, last) owner.
    pub worker_hostname: Option<String>,

    /// Token minted by the claim that made the current (or last) owner.
    /// Cleared when the record is requeued.
    pub claim_token: Option<String>,

    /// Last error text. Cleared on success.
    pub failure_message: Option<String>,
}

impl Record {
    /// The lease handed out by the claim that produced this record.
    pub fn lease(&self) -> Option<Lease> {
        self.claim_token.as_ref().map(|token| Lease {
            id: self.id,
            token: token.clone(),
        })
    }

    /// True when `lease` came from the claim that made the last owner,
    /// whatever state the record is in now.
    pub fn granted(&self, lease: &Lease) -> bool {
        self.id == lease.id && self.claim_token.as_deref() == Some(lease.token.as_str())
    }

    /// True when `lease` currently holds this record in `processing`.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.state == State::Processing && self.granted(lease)
    }

    /// True when the record can be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>, filter: &ClaimFilter) -> bool {
        matches!(self.state, State::Queued | State::Errored)
            && self.process_after.is_none_or(|at| at <= now)
            && filter.matches(self)
    }
}

/// Newtype for record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(RecordId)
            .map_err(|_| Error::Other(format!("invalid record id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Proof of one claim on one record.
///
/// Every claim mints a fresh token. After a reset and re-claim, a lease from
/// the earlier claim no longer matches, even when the same worker or
/// executor made both claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub id: RecordId,
    pub token: String,
}

impl Lease {
    /// A token no other claim has used.
    pub fn mint_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a worker.
    Queued,
    /// Owned by exactly one worker.
    Processing,
    /// Done successfully. Terminal.
    Completed,
    /// Last attempt failed; eligible again once `process_after` passes.
    Errored,
    /// Exhausted retries. Terminal.
    Failed,
    /// Canceled by an explicit request. Terminal.
    Canceled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Canceled)
                | (Processing, Completed)
                | (Processing, Errored)
                | (Processing, Failed)
                | (Processing, Queued)  // stalled, reset
                | (Processing, Canceled)
                | (Errored, Processing) // retry
                | (Errored, Queued)
                | (Errored, Failed)
                | (Errored, Canceled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed | State::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Queued => "queued",
            State::Processing => "processing",
            State::Completed => "completed",
            State::Errored => "errored",
            State::Failed => "failed",
            State::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(State::Queued),
            "processing" => Ok(State::Processing),
            "completed" => Ok(State::Completed),
            "errored" => Ok(State::Errored),
            "failed" => Ok(State::Failed),
            "canceled" => Ok(State::Canceled),
            other => Err(Error::Other(format!("unknown record state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Claim filter
// ---------------------------------------------------------------------------

/// Restricts which records a claim may select.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    /// Only records with exactly this tag. `None` accepts any record.
    pub tag: Option<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match &self.tag {
            Some(tag) => record.tag.as_deref() == Some(tag.as_str()),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat report
// ---------------------------------------------------------------------------

/// Result of a batched heartbeat.
///
/// `known` records are still held under the presented lease and had their
/// heartbeat extended. `canceled` records were canceled out from under the
/// lease holder. Any requested id in neither list is no longer the caller's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub known: Vec<RecordId>,
    pub canceled: Vec<RecordId>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A remote executor as last seen by the proxy, per queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    pub name: String,
    pub queue: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new records. The producer-facing API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub(crate) payload: serde_json::Value,
    pub(crate) tag: Option<String>,
    pub(crate) process_after: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            tag: None,
            process_after: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Delay visibility until `at`.
    pub fn process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = Some(at);
        self
    }
}
