//! Stalled-record resetter.
//!
//! Runs independently of any worker. Records whose owner stopped
//! heartbeating go back to `queued`, so work held by a crashed process
//! becomes visible again within roughly `heartbeat_timeout + interval`.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::error::Result;
use crate::model::RecordId;
use crate::store::Store;
use crate::telemetry::metrics::QueueMetrics;

/// Periodically requeues stalled records for one queue.
#[derive(Clone)]
pub struct Resetter {
    store: Arc<dyn Store>,
    heartbeat_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
    metrics: QueueMetrics,
}

impl Resetter {
    pub fn new(store: Arc<dyn Store>, heartbeat_timeout: Duration, interval: Duration) -> Self {
        let metrics = QueueMetrics::new(store.queue());
        Self {
            store,
            heartbeat_timeout,
            interval,
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    pub fn from_settings(store: Arc<dyn Store>, settings: &WorkerSettings) -> Self {
        Self::new(
            store,
            settings.heartbeat_timeout(),
            settings.reset_interval(),
        )
    }

    /// Signal the resetter loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown. Store errors are logged and retried next tick.
    pub async fn run(&self) {
        info!(
            queue = self.store.queue(),
            heartbeat_timeout_ms = self.heartbeat_timeout.as_millis() as u64,
            "resetter started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(queue = self.store.queue(), "resetter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(queue = self.store.queue(), "requeue of stalled records failed: {e}");
                    }
                }
            }
        }
    }

    /// One pass: requeue stalled records and refresh the depth gauge.
    pub async fn run_once(&self) -> Result<Vec<RecordId>> {
        let reset = match self.store.requeue_stalled(self.heartbeat_timeout).await {
            Ok(reset) => reset,
            Err(e) => {
                self.metrics.store_error("requeue_stalled");
                return Err(e);
            }
        };

        if reset.is_empty() {
            debug!(queue = self.store.queue(), "no stalled records");
        } else {
            warn!(
                queue = self.store.queue(),
                count = reset.len(),
                ids = ?reset,
                "requeued stalled records"
            );
        }
        self.metrics.reset(reset.len() as u64);

        match self.store.depth().await {
            Ok(depth) => self.metrics.depth(depth),
            Err(e) => {
                self.metrics.store_error("depth");
                debug!(queue = self.store.queue(), "depth unavailable: {e}");
            }
        }

        Ok(reset)
    }
}
