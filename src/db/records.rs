//! Postgres record store.
//!
//! Every transition is a single conditional `UPDATE` keyed on the record's
//! current state and claim token. Claims and stalled-record resets select their
//! rows with `FOR UPDATE SKIP LOCKED`, so concurrent claimants never block
//! each other and never receive the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{ClaimFilter, HeartbeatReport, Lease, NewRecord, Record, RecordId, State};
use crate::store::Store;

macro_rules! columns {
    () => {
        "id, queue_name, state, tag, payload, queued_at, started_at, finished_at, process_after, \
         num_resets, num_failures, last_heartbeat_at, worker_hostname, claim_token, failure_message"
    };
}

/// Record store for one named queue in the shared `queue_records` table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    queue: String,
}

impl PgStore {
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// Explain why a conditional update matched nothing.
    async fn ownership_error(&self, id: RecordId) -> Error {
        match self.get(id).await {
            Ok(_) => Error::OwnershipLost { id },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, new: NewRecord) -> Result<Record> {
        let row: RecordRow = sqlx::query_as(concat!(
            "INSERT INTO queue_records (queue_name, state, tag, payload, process_after)
             VALUES ($1, 'queued', $2, $3, $4)
             RETURNING ",
            columns!()
        ))
        .bind(&self.queue)
        .bind(&new.tag)
        .bind(&new.payload)
        .bind(new.process_after)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_record()
    }

    async fn claim(&self, worker: &str, filter: &ClaimFilter) -> Result<Option<Record>> {
        let row: Option<RecordRow> = sqlx::query_as(concat!(
            "UPDATE queue_records
             SET state = 'processing', worker_hostname = $2, claim_token = $4,
                 started_at = now(), last_heartbeat_at = now(), finished_at = NULL
             WHERE id = (
                 SELECT id FROM queue_records
                 WHERE queue_name = $1
                   AND state IN ('queued', 'errored')
                   AND (process_after IS NULL OR process_after <= now())
                   AND ($3::text IS NULL OR tag = $3)
                 ORDER BY queued_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING ",
            columns!()
        ))
        .bind(&self.queue)
        .bind(worker)
        .bind(&filter.tag)
        .bind(Lease::mint_token())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::try_into_record).transpose()
    }

    async fn heartbeat_many(&self, leases: &[Lease]) -> Result<HeartbeatReport> {
        let ids: Vec<i64> = leases.iter().map(|l| l.id.0).collect();
        let tokens: Vec<String> = leases.iter().map(|l| l.token.clone()).collect();

        let known: Vec<(i64,)> = sqlx::query_as(
            "UPDATE queue_records r SET last_heartbeat_at = now()
             FROM unnest($2::bigint[], $3::text[]) AS l(id, token)
             WHERE r.queue_name = $1 AND r.id = l.id AND r.claim_token = l.token
               AND r.state = 'processing'
             RETURNING r.id",
        )
        .bind(&self.queue)
        .bind(&ids)
        .bind(&tokens)
        .fetch_all(&self.pool)
        .await?;

        let canceled: Vec<(i64,)> = sqlx::query_as(
            "SELECT r.id FROM queue_records r
             JOIN unnest($2::bigint[], $3::text[]) AS l(id, token)
               ON r.id = l.id AND r.claim_token = l.token
             WHERE r.queue_name = $1 AND r.state = 'canceled'",
        )
        .bind(&self.queue)
        .bind(&ids)
        .bind(&tokens)
        .fetch_all(&self.pool)
        .await?;

        Ok(HeartbeatReport {
            known: known.into_iter().map(|(id,)| RecordId(id)).collect(),
            canceled: canceled.into_iter().map(|(id,)| RecordId(id)).collect(),
        })
    }

    async fn mark_complete(&self, lease: &Lease) -> Result<bool> {
        let id = lease.id;
        let rows_affected = sqlx::query(
            "UPDATE queue_records SET state = 'completed', finished_at = now(), failure_message = NULL
             WHERE queue_name = $1 AND id = $2 AND state = 'processing' AND claim_token = $3",
        )
        .bind(&self.queue)
        .bind(id.0)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 1 {
            return Ok(true);
        }

        // A retried completion under the same lease is a no-op.
        let current = self.get(id).await?;
        if current.state == State::Completed && current.granted(lease) {
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
        let id = lease.id;
        let rows_affected = sqlx::query(
            "UPDATE queue_records
             SET state = 'errored', num_failures = num_failures + 1, failure_message = $4,
                 finished_at = now(), process_after = $5
             WHERE queue_name = $1 AND id = $2 AND state = 'processing' AND claim_token = $3",
        )
        .bind(&self.queue)
        .bind(id.0)
        .bind(&lease.token)
        .bind(message)
        .bind(process_after)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.ownership_error(id).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, lease: &Lease, message: &str) -> Result<()> {
        let id = lease.id;
        let rows_affected = sqlx::query(
            "UPDATE queue_records
             SET state = 'failed', num_failures = num_failures + 1, failure_message = $4,
                 finished_at = now()
             WHERE queue_name = $1 AND id = $2 AND state = 'processing' AND claim_token = $3",
        )
        .bind(&self.queue)
        .bind(id.0)
        .bind(&lease.token)
        .bind(message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.ownership_error(id).await);
        }
        Ok(())
    }

    async fn requeue_stalled(&self, heartbeat_timeout: Duration) -> Result<Vec<RecordId>> {
        let reset: Vec<(i64,)> = sqlx::query_as(
            "UPDATE queue_records
             SET state = 'queued', num_resets = num_resets + 1, worker_hostname = NULL,
                 claim_token = NULL, started_at = NULL, last_heartbeat_at = NULL
             WHERE id IN (
                 SELECT id FROM queue_records
                 WHERE queue_name = $1
                   AND state = 'processing'
                   AND (last_heartbeat_at IS NULL
                        OR last_heartbeat_at < now() - make_interval(secs => $2))
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(&self.queue)
        .bind(heartbeat_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(reset.into_iter().map(|(id,)| RecordId(id)).collect())
    }

    async fn cancel(&self, id: RecordId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE queue_records SET state = 'canceled', finished_at = now()
             WHERE queue_name = $1 AND id = $2 AND state IN ('queued', 'errored', 'processing')",
        )
        .bind(&self.queue)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 1 {
            return Ok(true);
        }
        // Distinguish "already terminal" from "no such record".
        self.get(id).await.map(|_| false)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        let row: Option<RecordRow> = sqlx::query_as(concat!(
            "SELECT ",
            columns!(),
            " FROM queue_records WHERE queue_name = $1 AND id = $2"
        ))
        .bind(&self.queue)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("record {id} in queue {}", self.queue)))?
            .try_into_record()
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<Record>> {
        let rows: Vec<RecordRow> = sqlx::query_as(concat!(
            "SELECT ",
            columns!(),
            " FROM queue_records
              WHERE queue_name = $1 AND ($2::text IS NULL OR state = $2)
              ORDER BY queued_at, id
              LIMIT $3"
        ))
        .bind(&self.queue)
        .bind(state.map(State::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecordRow::try_into_record).collect()
    }

    async fn depth(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_records
             WHERE queue_name = $1 AND state IN ('queued', 'errored')",
        )
        .bind(&self.queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecordRow {
    id: i64,
    queue_name: String,
    state: String,
    tag: Option<String>,
    payload: serde_json::Value,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    process_after: Option<DateTime<Utc>>,
    num_resets: i32,
    num_failures: i32,
    last_heartbeat_at: Option<DateTime<Utc>>,
    worker_hostname: Option<String>,
    claim_token: Option<String>,
    failure_message: Option<String>,
}

impl RecordRow {
    fn try_into_record(self) -> Result<Record> {
        Ok(Record {
            id: RecordId(self.id),
            queue: self.queue_name,
            state: self.state.parse()?,
            tag: self.tag,
            payload: self.payload,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            process_after: self.process_after,
            num_resets: self.num_resets.max(0) as u32,
            num_failures: self.num_failures.max(0) as u32,
            last_heartbeat_at: self.last_heartbeat_at,
            worker_hostname: self.worker_hostname,
            claim_token: self.claim_token,
            failure_message: self.failure_message,
        })
    }
}
