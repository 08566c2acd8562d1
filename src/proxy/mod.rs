//! Executor queue proxy.
//!
//! Out-of-process executors cannot share memory with the store, so they pull
//! work through this proxy. Every operation authenticates the executor's
//! bearer token against the queue's credential before touching the store.
//! Each dequeued job carries the lease minted by its claim, and every later
//! operation on that job must present it.

pub mod http;
pub mod registry;

pub use registry::{QueueHandle, QueueRegistry, RecordTransformer};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::RetryPolicy;
use crate::error::{Error, Result};
use crate::model::{HeartbeatReport, Lease, Record, RecordId};
use crate::store::ExecutorStore;

/// A record as handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: RecordId,
    /// Claim token. Echoed back on heartbeat and outcome calls.
    pub token: String,
    pub queue: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: serde_json::Value,
    /// Queue-specific extras produced by the queue's transformer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Job {
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id,
            token: self.token.clone(),
        }
    }
}

/// Network-agnostic implementation of the executor operations.
pub struct ExecutorProxy {
    registry: Arc<QueueRegistry>,
    retry: RetryPolicy,
    executors: Arc<dyn ExecutorStore>,
}

impl ExecutorProxy {
    pub fn new(
        registry: Arc<QueueRegistry>,
        retry: RetryPolicy,
        executors: Arc<dyn ExecutorStore>,
    ) -> Self {
        Self {
            registry,
            retry,
            executors,
        }
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    fn authorized(&self, queue: &str, access_token: &str) -> Result<&QueueHandle> {
        let handle = self.registry.get(queue)?;
        handle.authenticate(access_token).inspect_err(|_| {
            warn!(queue, "rejected executor request with bad access token");
        })?;
        Ok(handle)
    }

    /// Note that `executor` is alive. Registry trouble never fails the call.
    async fn seen(&self, queue: &str, executor: &str) {
        if let Err(e) = self.executors.upsert_heartbeat(executor, queue).await {
            warn!(queue, executor, "could not update executor registry: {e}");
        }
    }

    /// Claim the next record for `executor`, if any.
    pub async fn dequeue(
        &self,
        queue: &str,
        access_token: &str,
        executor: &str,
    ) -> Result<Option<Job>> {
        let handle = self.authorized(queue, access_token)?;
        self.seen(queue, executor).await;

        let Some(record) = handle.store.claim(executor, &handle.filter).await? else {
            return Ok(None);
        };
        let lease = record
            .lease()
            .ok_or_else(|| Error::Other(format!("record {} claimed without a token", record.id)))?;
        handle.metrics.claimed();

        let metadata = match &handle.transformer {
            Some(transformer) => match transformer.transform(&record) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    // The executor never sees this record, so nothing would
                    // heartbeat it; fail it rather than leave it stranded.
                    let message = format!("failed to prepare job: {e}");
                    handle.store.mark_failed(&lease, &message).await?;
                    handle.metrics.failed();
                    return Err(e);
                }
            },
            None => None,
        };

        info!(queue, executor, id = %record.id, "job dequeued");
        Ok(Some(job_from(record, lease.token, metadata)))
    }

    /// Batched liveness extension for every job `executor` holds.
    pub async fn heartbeat(
        &self,
        queue: &str,
        access_token: &str,
        executor: &str,
        leases: &[Lease],
    ) -> Result<HeartbeatReport> {
        let handle = self.authorized(queue, access_token)?;
        self.seen(queue, executor).await;
        let report = handle.store.heartbeat_many(leases).await?;
        for _ in &report.canceled {
            handle.metrics.canceled();
        }

        let dropped = leases
            .len()
            .saturating_sub(report.known.len() + report.canceled.len());
        if dropped > 0 || !report.canceled.is_empty() {
            info!(
                queue,
                executor,
                canceled = ?report.canceled,
                dropped,
                "heartbeat reported jobs to abandon"
            );
        } else {
            debug!(queue, executor, jobs = leases.len(), "heartbeat");
        }
        Ok(report)
    }

    /// Idempotent: completing an already-completed job succeeds.
    pub async fn mark_complete(
        &self,
        queue: &str,
        access_token: &str,
        executor: &str,
        lease: &Lease,
    ) -> Result<()> {
        let handle = self.authorized(queue, access_token)?;
        let id = lease.id;
        match handle.store.mark_complete(lease).await {
            Ok(true) => {
                handle.metrics.completed();
                info!(queue, executor, %id, "job completed");
                Ok(())
            }
            Ok(false) => {
                debug!(queue, executor, %id, "repeated completion ignored");
                Ok(())
            }
            Err(e) => Err(self.note_lost(handle, e)),
        }
    }

    /// Report a failed attempt. Retries remain → `errored` with backoff;
    /// otherwise `failed`.
    pub async fn mark_errored(
        &self,
        queue: &str,
        access_token: &str,
        executor: &str,
        lease: &Lease,
        message: &str,
    ) -> Result<()> {
        let handle = self.authorized(queue, access_token)?;
        let id = lease.id;
        let record = handle.store.get(id).await?;
        if !record.is_held_by(lease) {
            return Err(self.note_lost(handle, Error::OwnershipLost { id }));
        }

        if self.retry.should_retry(record.num_failures) {
            let process_after = self.retry.next_attempt_at(record.num_failures);
            handle
                .store
                .mark_errored(lease, message, process_after)
                .await
                .map_err(|e| self.note_lost(handle, e))?;
            handle.metrics.errored();
            warn!(queue, executor, %id, error = message, "job errored, will retry");
        } else {
            handle
                .store
                .mark_failed(lease, message)
                .await
                .map_err(|e| self.note_lost(handle, e))?;
            handle.metrics.failed();
            warn!(queue, executor, %id, error = message, "job failed, retries exhausted");
        }
        Ok(())
    }

    /// Terminal failure, no retry.
    pub async fn mark_failed(
        &self,
        queue: &str,
        access_token: &str,
        executor: &str,
        lease: &Lease,
        message: &str,
    ) -> Result<()> {
        let handle = self.authorized(queue, access_token)?;
        handle
            .store
            .mark_failed(lease, message)
            .await
            .map_err(|e| self.note_lost(handle, e))?;
        handle.metrics.failed();
        warn!(queue, executor, id = %lease.id, error = message, "job failed");
        Ok(())
    }

    fn note_lost(&self, handle: &QueueHandle, e: Error) -> Error {
        if let Error::OwnershipLost { id } = &e {
            handle.metrics.ownership_lost();
            warn!(queue = handle.name(), %id, "executor no longer owns job");
        }
        e
    }
}

fn job_from(record: Record, token: String, metadata: Option<serde_json::Value>) -> Job {
    Job {
        id: record.id,
        token,
        queue: record.queue,
        attempt: record.num_failures + 1,
        payload: record.payload,
        metadata,
    }
}
