//! Typed configuration.
//!
//! Process-level settings (connection strings, credentials, listen address)
//! come from environment variables and fail fast when required ones are
//! missing. Engine tuning and queue definitions live in a TOML file, see
//! [`settings`]. Sensitive values are wrapped in `SecretString` to keep them
//! out of logs.

pub mod secrets;
pub mod settings;

pub use settings::{MAX_DURATION_MS, QueueSettings, Settings, WorkerSettings};

use crate::error::{Error, Result};
use secrecy::SecretString;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3189";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Shared executor access token, used by queues without their own.
    pub executor_access_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub listen_addr: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            executor_access_token: optional_var("EXECUTOR_ACCESS_TOKEN").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            listen_addr: optional_var("EXECQ_LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
