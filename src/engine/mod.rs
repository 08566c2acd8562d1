//! Execution engine: worker loop, retry policy, and stalled-record resetter.

pub mod resetter;
pub mod retry;
pub mod worker;

pub use resetter::Resetter;
pub use retry::{Backoff, RetryPolicy};
pub use worker::{Worker, WorkerConfig, default_identity};
