//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool is shared by every queue; each named queue gets its own
//! [`PgStore`] view over the shared `queue_records` table.

pub mod executors;
pub mod records;

pub use executors::PgExecutorStore;
pub use records::PgStore;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all queues.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// A record store scoped to one named queue.
    pub fn store(&self, queue: impl Into<String>) -> PgStore {
        PgStore::new(self.pool.clone(), queue)
    }

    /// The executor registry shared by every queue.
    pub fn executors(&self) -> PgExecutorStore {
        PgExecutorStore::new(self.pool.clone())
    }
}
