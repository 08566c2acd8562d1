//! Metric instrument factories for execq.
//!
//! Instruments come from the `"execq"` meter of whichever provider
//! [`super::register_meter_provider`] installed, and carry a `queue` label.
//! Instruments created before registration, or with none, are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for execq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("execq")
}

/// Counter: record lifecycle events.
/// Labels: `queue`, `event` ("claimed" | "completed" | "errored" | "failed" |
/// "reset" | "ownership_lost" | "canceled").
pub fn record_events() -> Counter<u64> {
    meter()
        .u64_counter("execq.records.events")
        .with_description("Record lifecycle events")
        .build()
}

/// Counter: store calls that failed for infrastructure reasons.
/// Labels: `queue`, `operation`.
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("execq.store.errors")
        .with_description("Failed record store calls")
        .build()
}

/// Gauge: records waiting to be claimed.
/// Labels: `queue`.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("execq.queue.depth")
        .with_description("Records waiting to be claimed")
        .build()
}

/// Histogram: handler execution duration in milliseconds.
/// Labels: `queue`, `outcome`.
pub fn record_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("execq.record.duration_ms")
        .with_description("Record execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Instruments bound to one queue.
#[derive(Clone)]
pub struct QueueMetrics {
    queue: KeyValue,
    events: Counter<u64>,
    store_errors: Counter<u64>,
    depth: Gauge<u64>,
    duration: Histogram<f64>,
}

impl QueueMetrics {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: KeyValue::new("queue", queue.to_string()),
            events: record_events(),
            store_errors: store_errors(),
            depth: queue_depth(),
            duration: record_duration_ms(),
        }
    }

    fn event(&self, event: &'static str, n: u64) {
        self.events
            .add(n, &[self.queue.clone(), KeyValue::new("event", event)]);
    }

    pub fn claimed(&self) {
        self.event("claimed", 1);
    }

    pub fn completed(&self) {
        self.event("completed", 1);
    }

    pub fn errored(&self) {
        self.event("errored", 1);
    }

    pub fn failed(&self) {
        self.event("failed", 1);
    }

    pub fn ownership_lost(&self) {
        self.event("ownership_lost", 1);
    }

    /// The holder of a record learned it was canceled.
    pub fn canceled(&self) {
        self.event("canceled", 1);
    }

    pub fn reset(&self, n: u64) {
        if n > 0 {
            self.event("reset", n);
        }
    }

    pub fn store_error(&self, operation: &'static str) {
        self.store_errors.add(
            1,
            &[self.queue.clone(), KeyValue::new("operation", operation)],
        );
    }

    pub fn depth(&self, depth: u64) {
        self.depth.record(depth, &[self.queue.clone()]);
    }

    pub fn duration(&self, outcome: &'static str, ms: f64) {
        self.duration
            .record(ms, &[self.queue.clone(), KeyValue::new("outcome", outcome)]);
    }
}
