//! Record store contract.
//!
//! The store is the single source of truth for record state and the only
//! component allowed to mutate it. Every transition is a conditional update
//! keyed on the record's current state and owner, so concurrent workers need
//! no coordination beyond what the store provides.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::error::Error;
use crate::model::{
    ClaimFilter, Executor, HeartbeatReport, Lease, NewRecord, Record, RecordId, State,
};

pub use memory::{MemoryExecutorStore, MemoryStore};

/// Persistence over one logical queue of records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the queue this store serves.
    fn queue(&self) -> &str;

    /// Insert a new `queued` record.
    async fn enqueue(&self, new: NewRecord) -> Result<Record>;

    /// Atomically select the oldest eligible record and move it to
    /// `processing` under `worker`, minting a fresh claim token. No two
    /// concurrent callers ever receive the same record.
    async fn claim(&self, worker: &str, filter: &ClaimFilter) -> Result<Option<Record>>;

    /// Extend liveness for every record still held under its lease.
    async fn heartbeat_many(&self, leases: &[Lease]) -> Result<HeartbeatReport>;

    /// Extend liveness for one record. Fails with `OwnershipLost` when the
    /// lease no longer holds the record in `processing`.
    async fn heartbeat(&self, lease: &Lease) -> Result<()> {
        let report = self.heartbeat_many(std::slice::from_ref(lease)).await?;
        if report.known.contains(&lease.id) {
            Ok(())
        } else {
            Err(Error::OwnershipLost { id: lease.id })
        }
    }

    /// `processing → completed`. Returns `false` when the record was already
    /// completed under the same lease (a retried call).
    async fn mark_complete(&self, lease: &Lease) -> Result<bool>;

    /// `processing → errored`; the record becomes claimable again at
    /// `process_after`.
    async fn mark_errored(
        &self,
        lease: &Lease,
        message: &str,
        process_after: DateTime<Utc>,
    ) -> Result<()>;

    /// `processing → failed`. Terminal.
    async fn mark_failed(&self, lease: &Lease, message: &str) -> Result<()>;

    /// Return every `processing` record whose heartbeat is older than
    /// `heartbeat_timeout` to `queued`, bumping `num_resets`.
    async fn requeue_stalled(&self, heartbeat_timeout: Duration) -> Result<Vec<RecordId>>;

    /// Cancel a non-terminal record. Returns `false` if it was already
    /// terminal.
    async fn cancel(&self, id: RecordId) -> Result<bool>;

    async fn get(&self, id: RecordId) -> Result<Record>;

    /// Records ordered by `queued_at`, optionally restricted to one state.
    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<Record>>;

    /// Number of records waiting to be claimed (`queued` or `errored`).
    async fn depth(&self) -> Result<u64>;
}

/// Executors seen by the proxy, keyed by name and queue.
#[async_trait]
pub trait ExecutorStore: Send + Sync {
    /// Record that `name` just talked to the proxy on behalf of `queue`.
    async fn upsert_heartbeat(&self, name: &str, queue: &str) -> Result<()>;

    /// Every known executor, most recently seen first.
    async fn list_executors(&self) -> Result<Vec<Executor>>;
}

/// Convert a std duration to a chrono duration, saturating on overflow.
fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, clamped to the earliest representable instant.
pub(crate) fn saturating_sub(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
