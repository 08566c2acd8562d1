//! Postgres executor registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::model::Executor;
use crate::store::ExecutorStore;

/// Executor registry in the `executors` table.
#[derive(Clone)]
pub struct PgExecutorStore {
    pool: PgPool,
}

impl PgExecutorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutorStore for PgExecutorStore {
    async fn upsert_heartbeat(&self, name: &str, queue: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO executors (name, queue_name) VALUES ($1, $2)
             ON CONFLICT (name, queue_name) DO UPDATE SET last_seen_at = now()",
        )
        .bind(name)
        .bind(queue)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_executors(&self) -> Result<Vec<Executor>> {
        let rows: Vec<ExecutorRow> = sqlx::query_as(
            "SELECT name, queue_name, first_seen_at, last_seen_at FROM executors
             ORDER BY last_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExecutorRow::into_executor).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ExecutorRow {
    name: String,
    queue_name: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl ExecutorRow {
    fn into_executor(self) -> Executor {
        Executor {
            name: self.name,
            queue: self.queue_name,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
        }
    }
}
