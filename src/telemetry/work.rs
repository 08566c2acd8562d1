//! Record execution span helpers.
//!
//! Provides span creation and state-transition recording for records
//! flowing through a worker or the executor proxy.

use tracing::Span;

use crate::model::{Record, State};

/// Start a span for one execution attempt of a record.
///
/// The `record.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_record_span(record: &Record, worker: &str) -> Span {
    tracing::info_span!(
        "record.execute",
        "record.queue" = %record.queue,
        "record.id" = %record.id,
        "record.attempt" = record.num_failures + 1,
        "record.resets" = record.num_resets,
        "worker" = worker,
        "record.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}

/// Record the final outcome of an execution attempt.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("record.outcome", outcome);
}
