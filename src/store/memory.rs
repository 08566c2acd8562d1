//! In-process record store.
//!
//! Every operation runs inside one mutex critical section, which plays the
//! role of the row lock the Postgres store takes: selection and update of a
//! record can never interleave with another caller's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{ExecutorStore, Store, saturating_sub};
use crate::error::{Error, Result};
use crate::model::{
    ClaimFilter, Executor, HeartbeatReport, Lease, NewRecord, Record, RecordId, State,
};

#[derive(Default)]
struct Inner {
    records: BTreeMap<RecordId, Record>,
    next_id: i64,
}

/// Record store held entirely in memory. Used for single-process
/// deployments and tests.
pub struct MemoryStore {
    queue: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other(format!("memory store for {} is poisoned", self.queue)))
    }
}

/// Look up a record the lease must currently hold.
fn held_mut<'a>(inner: &'a mut Inner, lease: &Lease) -> Result<&'a mut Record> {
    let id = lease.id;
    let record = inner
        .records
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
    if record.is_held_by(lease) {
        Ok(record)
    } else {
        Err(Error::OwnershipLost { id })
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, new: NewRecord) -> Result<Record> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = RecordId(inner.next_id);
        let record = Record {
            id,
            queue: self.queue.clone(),
            state: State::Queued,
            tag: new.tag,
            payload: new.payload,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            process_after: new.process_after,
            num_resets: 0,
            num_failures: 0,
            last_heartbeat_at: None,
            worker_hostname: None,
            claim_token: None,
            failure_message: None,
        };
        inner.records.insert(id, record.clone());
        Ok(record)
    }

    async fn claim(&self, worker: &str, filter: &ClaimFilter) -> Result<Option<Record>> {
        let now = Utc::now();
        let mut inner = self.lock()?;

        let next = inner
            .records
            .values()
            .filter(|r| r.is_eligible(now, filter))
            .min_by_key(|r| (r.queued_at, r.id))
            .map(|r| r.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
        record.state = State::Processing;
        record.worker_hostname = Some(worker.to_string());
        record.claim_token = Some(Lease::mint_token());
        record.started_at = Some(now);
        record.last_heartbeat_at = Some(now);
        record.finished_at = None;
        Ok(Some(record.clone()))
    }

    async fn heartbeat_many(&self, leases: &[Lease]) -> Result<HeartbeatReport> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let mut report = HeartbeatReport::default();

        for lease in leases {
            let Some(record) = inner.records.get_mut(&lease.id) else {
                continue;
            };
            if record.is_held_by(lease) {
                record.last_heartbeat_at = Some(now);
                report.known.push(lease.id);
            } else if record.state == State::Canceled && record.granted(lease) {
                report.canceled.push(lease.id);
            }
        }

        Ok(report)
    }

    async fn mark_complete(&self, lease: &Lease) -> Result<bool> {
        let id = lease.id;
        let mut inner = self.lock()?;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("record {id}")))?;

        if record.is_held_by(lease) {
            record.state = State::Completed;
            record.finished_at = Some(Utc::now());
            record.failure_message = None;
            Ok(true)
        } else if record.state == State::Completed && record.granted(lease) {
            Ok(false)
        } else {
            Err(Error::OwnershipLost { id })
        }
    }

    async fn mark_errored(
        &self,
        lease: &Lease,
        message: &str,
        process_after: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let record = held_mut(&mut inner, lease)?;
        record.state = State::Errored;
        record.num_failures += 1;
        record.failure_message = Some(message.to_string());
        record.finished_at = Some(Utc::now());
        record.process_after = Some(process_after);
        Ok(())
    }

    async fn mark_failed(&self, lease: &Lease, message: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let record = held_mut(&mut inner, lease)?;
        record.state = State::Failed;
        record.num_failures += 1;
        record.failure_message = Some(message.to_string());
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn requeue_stalled(&self, heartbeat_timeout: Duration) -> Result<Vec<RecordId>> {
        let cutoff = saturating_sub(Utc::now(), heartbeat_timeout);
        let mut inner = self.lock()?;
        let mut reset = Vec::new();

        for record in inner.records.values_mut() {
            let stale = record
                .last_heartbeat_at
                .is_none_or(|beat| beat < cutoff);
            if record.state == State::Processing && stale {
                record.state = State::Queued;
                record.num_resets += 1;
                record.worker_hostname = None;
                record.claim_token = None;
                record.started_at = None;
                record.last_heartbeat_at = None;
                reset.push(record.id);
            }
        }

        Ok(reset)
    }

    async fn cancel(&self, id: RecordId) -> Result<bool> {
        let mut inner = self.lock()?;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
        if !record.state.can_transition_to(State::Canceled) {
            return Ok(false);
        }
        record.state = State::Canceled;
        record.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        self.lock()?
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record {id}")))
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<Record>> {
        let inner = self.lock()?;
        let mut records: Vec<Record> = inner
            .records
            .values()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.queued_at, r.id));
        records.truncate(limit);
        Ok(records)
    }

    async fn depth(&self) -> Result<u64> {
        let inner = self.lock()?;
        let depth = inner
            .records
            .values()
            .filter(|r| matches!(r.state, State::Queued | State::Errored))
            .count();
        Ok(depth as u64)
    }
}

/// Executor registry held in memory, keyed by (name, queue).
#[derive(Default)]
pub struct MemoryExecutorStore {
    executors: Mutex<BTreeMap<(String, String), Executor>>,
}

impl MemoryExecutorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutorStore for MemoryExecutorStore {
    async fn upsert_heartbeat(&self, name: &str, queue: &str) -> Result<()> {
        let now = Utc::now();
        let mut executors = self
            .executors
            .lock()
            .map_err(|_| Error::Other("executor registry is poisoned".to_string()))?;
        executors
            .entry((name.to_string(), queue.to_string()))
            .and_modify(|e| e.last_seen_at = now)
            .or_insert_with(|| Executor {
                name: name.to_string(),
                queue: queue.to_string(),
                first_seen_at: now,
                last_seen_at: now,
            });
        Ok(())
    }

    async fn list_executors(&self) -> Result<Vec<Executor>> {
        let executors = self
            .executors
            .lock()
            .map_err(|_| Error::Other("executor registry is poisoned".to_string()))?;
        let mut all: Vec<Executor> = executors.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(all)
    }
}
