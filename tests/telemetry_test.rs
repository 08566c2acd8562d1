//! Integration tests for telemetry initialization and span helpers.

use execq::model::{ClaimFilter, NewRecord, State};
use execq::store::{MemoryStore, Store};
use execq::telemetry::metrics::QueueMetrics;
use serde_json::json;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = execq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "execq-test".to_string(),
        instance_id: execq::engine::default_identity(),
        role: "worker".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = execq::telemetry::init_telemetry(config);
}

#[tokio::test]
async fn record_span_creates_and_records_transition() {
    let store = MemoryStore::new("spans");
    store.enqueue(NewRecord::new(json!({}))).await.unwrap();
    let record = store.claim("w1", &ClaimFilter::any()).await.unwrap().unwrap();
    assert!(record.lease().is_some());

    let span = execq::telemetry::work::start_record_span(&record, "w1");
    execq::telemetry::work::record_state_transition(&span, State::Processing, State::Completed);
    execq::telemetry::work::record_outcome(&span, "completed");
}

#[test]
fn queue_metrics_record_without_exporter() {
    // With no meter provider installed these are no-ops; they must not panic.
    let metrics = QueueMetrics::new("metrics");
    metrics.claimed();
    metrics.completed();
    metrics.errored();
    metrics.failed();
    metrics.ownership_lost();
    metrics.canceled();
    metrics.reset(2);
    metrics.store_error("claim");
    metrics.depth(5);
    metrics.duration("completed", 12.5);
}
