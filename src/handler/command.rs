//! Handler that runs an external command per record.
//!
//! The command sees the record through environment variables and its exit
//! status decides the outcome. Cancellation kills the child process.

use anyhow::{Context, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Handler;
use crate::model::Record;

pub const ENV_QUEUE: &str = "EXECQ_QUEUE";
pub const ENV_RECORD_ID: &str = "EXECQ_RECORD_ID";
pub const ENV_PAYLOAD: &str = "EXECQ_PAYLOAD";
pub const ENV_ATTEMPT: &str = "EXECQ_ATTEMPT";

/// Runs `command args...` once per record.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Relative paths containing a separator resolve against the process
    /// CWD; bare names are left for `PATH` lookup.
    fn resolve(command: &Path) -> std::io::Result<PathBuf> {
        if command.is_relative() && command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(command))
        } else {
            Ok(command.to_path_buf())
        }
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, cancel: CancellationToken, record: &Record) -> anyhow::Result<()> {
        let command = Self::resolve(&self.command)?;
        let payload = serde_json::to_string(&record.payload)?;

        debug!(
            record_id = %record.id,
            command = %command.display(),
            "running command"
        );

        let mut child = Command::new(&command)
            .args(&self.args)
            .env(ENV_QUEUE, &record.queue)
            .env(ENV_RECORD_ID, record.id.to_string())
            .env(ENV_PAYLOAD, payload)
            .env(ENV_ATTEMPT, (record.num_failures + 1).to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", command.display()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    bail!(
                        "{} exited with status {}",
                        command.display(),
                        status.code().unwrap_or(-1)
                    )
                }
            }
            // Dropping the child kills it.
            _ = cancel.cancelled() => Err(anyhow::anyhow!("canceled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecordId, State};
    use chrono::Utc;
    use std::time::Duration;

    fn record() -> Record {
        Record {
            id: RecordId(7),
            queue: "shell".to_string(),
            state: State::Processing,
            tag: None,
            payload: serde_json::json!({"n": 1}),
            queued_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            process_after: None,
            num_resets: 0,
            num_failures: 0,
            last_heartbeat_at: Some(Utc::now()),
            worker_hostname: Some("w1".to_string()),
            claim_token: Some("token-1".to_string()),
            failure_message: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_outcome() {
        let ok = CommandHandler::new("sh").args(["-c", "test \"$EXECQ_RECORD_ID\" = 7"]);
        assert!(ok.handle(CancellationToken::new(), &record()).await.is_ok());

        let fail = CommandHandler::new("sh").args(["-c", "exit 3"]);
        let err = fail
            .handle(CancellationToken::new(), &record())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_long_command() {
        let handler = CommandHandler::new("sleep").args(["30"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            handler.handle(cancel, &record()),
        )
        .await
        .expect("handler should return promptly after cancel");
        assert!(result.is_err());
    }
}
