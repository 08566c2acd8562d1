//! Handler contract.
//!
//! A handler is the business logic behind one queue. The engine hands it an
//! opaque record and a cancellation token; the handler must stop promptly
//! once the token fires, and must tolerate being invoked more than once for
//! the same payload (execution is at-least-once).

pub mod command;

pub use command::CommandHandler;

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::model::Record;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one record. An error marks the attempt as failed.
    async fn handle(&self, cancel: CancellationToken, record: &Record) -> anyhow::Result<()>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Build a handler from a closure taking the cancellation token and an owned
/// copy of the record.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, record: &Record) -> anyhow::Result<()> {
        (self.0)(cancel, record.clone()).await
    }
}
