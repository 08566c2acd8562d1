//! Engine settings and queue definitions, loaded from TOML.
//!
//! ```toml
//! [worker]
//! poll_interval_ms = 1000
//! max_concurrency = 4
//! max_retries = 3
//!
//! [[queues]]
//! name = "codeintel"
//! access_token_env = "CODEINTEL_EXECUTOR_TOKEN"
//!
//! [[queues]]
//! name = "batches"
//! tag = "batch-spec"
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for every duration setting: 30 days.
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Top-level settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
}

/// Timing and retry knobs shared by workers, resetters and the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Idle sleep between claim attempts.
    pub poll_interval_ms: u64,
    /// How often an executing record is heartbeated.
    pub heartbeat_interval_ms: u64,
    /// A processing record without a heartbeat for this long is stalled.
    pub heartbeat_timeout_ms: u64,
    /// How often the resetter scans for stalled records.
    pub reset_interval_ms: u64,
    /// Concurrent executions per worker host.
    pub max_concurrency: usize,
    /// Failed attempts that are retried before a record is marked failed.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Relative jitter applied to each backoff, in `[0, 1)`.
    pub backoff_jitter: f64,
    /// Time a canceled handler gets to return before it is aborted.
    pub cancel_grace_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 30_000,
            reset_interval_ms: 10_000,
            max_concurrency: 4,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.2,
            cancel_grace_ms: 10_000,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, ms) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("reset_interval_ms", self.reset_interval_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_max_ms", self.backoff_max_ms),
            ("cancel_grace_ms", self.cancel_grace_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(Error::Config(format!(
                    "{name} ({ms}) exceeds the {MAX_DURATION_MS} ms limit"
                )));
            }
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 || self.reset_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms and reset_interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.heartbeat_timeout_ms
        {
            return Err(Error::Config(format!(
                "heartbeat_interval_ms ({}) must be positive and shorter than heartbeat_timeout_ms ({})",
                self.heartbeat_interval_ms, self.heartbeat_timeout_ms
            )));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(Error::Config(format!(
                "backoff_jitter must be in [0, 1), got {}",
                self.backoff_jitter
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(
                "backoff_base_ms must not exceed backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// One named queue exposed to workers and executors.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    pub name: String,
    /// Only records with this tag are handed out for this queue.
    #[serde(default)]
    pub tag: Option<String>,
    /// Environment variable holding this queue's executor access token.
    /// Falls back to `EXECUTOR_ACCESS_TOKEN` when unset.
    #[serde(default)]
    pub access_token_env: Option<String>,
}

impl Settings {
    /// Parse settings from a TOML string and validate them.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(Error::Config("queue name must not be empty".into()));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(Error::Config(format!("duplicate queue {}", queue.name)));
            }
        }
        Ok(())
    }
}
