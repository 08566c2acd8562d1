//! Error types for execq.

use thiserror::Error;

use crate::model::{RecordId, State};

#[derive(Debug, Error)]
pub enum Error {
    /// The caller no longer owns the record: it was reset, canceled, or
    /// finished under another owner.
    #[error("ownership lost for record {id}")]
    OwnershipLost { id: RecordId },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("authentication failed")]
    Unauthorized,

    /// A request body or parameter could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure failures that say nothing about the record itself.
    /// Callers back off and retry their own cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Io(_) | Error::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
