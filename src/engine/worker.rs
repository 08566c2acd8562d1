//! Worker execution loop: claim records, run the handler, report outcomes.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::config::WorkerSettings;
use crate::error::Error;
use crate::handler::Handler;
use crate::model::{ClaimFilter, Lease, Record, RecordId, State};
use crate::store::Store;
use crate::telemetry::metrics::QueueMetrics;
use crate::telemetry::work::{record_outcome, record_state_transition, start_record_span};

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name stamped on claimed records as their owner.
    pub identity: String,
    /// Idle sleep between claim attempts, also the backoff after store errors.
    pub poll_interval: Duration,
    /// Interval between heartbeats for an executing record.
    pub heartbeat_interval: Duration,
    /// Concurrent executions.
    pub max_concurrency: usize,
    /// Time a canceled handler gets before its task is aborted.
    pub cancel_grace: Duration,
    pub retry: RetryPolicy,
    pub filter: ClaimFilter,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            identity: default_identity(),
            poll_interval: settings.poll_interval(),
            heartbeat_interval: settings.heartbeat_interval(),
            max_concurrency: settings.max_concurrency.max(1),
            cancel_grace: settings.cancel_grace(),
            retry: RetryPolicy::from_settings(settings),
            filter: ClaimFilter::any(),
        }
    }
}

/// `hostname:uuid`, unique per worker instance.
pub fn default_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", Uuid::new_v4())
}

/// Polls one queue and executes claimed records with a bounded number of
/// concurrent slots.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    handler: Arc<dyn Handler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    slots: Arc<Semaphore>,
    metrics: QueueMetrics,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, handler: Arc<dyn Handler>, config: WorkerConfig) -> Self {
        let metrics = QueueMetrics::new(store.queue());
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            store,
            handler,
            config,
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            slots,
            metrics,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Hint that new work is available; an idle worker polls immediately.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Stop claiming. `run` returns once in-flight executions finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) {
        info!(
            queue = self.store.queue(),
            worker = %self.config.identity,
            slots = self.config.max_concurrency,
            "worker started"
        );

        let mut executions = JoinSet::new();

        loop {
            while let Some(done) = executions.try_join_next() {
                if let Err(e) = done {
                    error!("execution task failed: {e}");
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break, // semaphore closed
                },
            };

            match self
                .store
                .claim(&self.config.identity, &self.config.filter)
                .await
            {
                Ok(Some(record)) => {
                    self.metrics.claimed();
                    let worker = self.clone();
                    executions.spawn(async move {
                        worker.execute(record).await;
                        drop(permit);
                    });
                    // A slot may still be free; try the next record right away.
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    self.metrics.store_error("claim");
                    warn!(queue = self.store.queue(), "claim failed, backing off: {e}");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => debug!("woken for new work"),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            queue = self.store.queue(),
            in_flight = executions.len(),
            "worker shutting down, draining executions"
        );
        while let Some(done) = executions.join_next().await {
            if let Err(e) = done {
                error!("execution task failed: {e}");
            }
        }
        info!(queue = self.store.queue(), "worker stopped");
    }

    /// Run the handler for one claimed record and report its outcome.
    async fn execute(&self, record: Record) {
        let span = start_record_span(&record, &self.config.identity);

        async {
            let Some(lease) = record.lease() else {
                error!(id = %record.id, "claimed record carries no claim token");
                return;
            };
            debug!(id = %record.id, "record claimed");
            let started = Instant::now();
            let cancel = CancellationToken::new();

            let handler = Arc::clone(&self.handler);
            let token = cancel.clone();
            let owned = record.clone();
            let mut task = tokio::spawn(
                async move { handler.handle(token, &owned).await }.in_current_span(),
            );

            let heartbeats = self.heartbeat_until_lost(&lease);
            tokio::pin!(heartbeats);

            let joined = tokio::select! {
                res = &mut task => res,
                lost = &mut heartbeats => {
                    // The lease no longer holds the record; stop without reporting.
                    cancel.cancel();
                    self.note_lost(record.id, lost, &span);
                    if tokio::time::timeout(self.config.cancel_grace, &mut task)
                        .await
                        .is_err()
                    {
                        warn!(id = %record.id, "handler ignored cancellation, aborting");
                        task.abort();
                    }
                    return;
                }
            };

            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            match failure_message(joined) {
                None => self.report_success(&record, &lease, &span, duration_ms).await,
                Some(message) => {
                    self.report_failure(&record, &lease, &message, &span, duration_ms)
                        .await
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    fn note_lost(&self, id: RecordId, lost: Lost, span: &tracing::Span) {
        match lost {
            Lost::Canceled => {
                self.metrics.canceled();
                record_outcome(span, "canceled");
                info!(%id, "record canceled, stopping handler");
            }
            Lost::Ownership => {
                self.metrics.ownership_lost();
                record_outcome(span, "ownership_lost");
                warn!(%id, "ownership lost, canceling handler");
            }
        }
    }

    /// Heartbeat under `lease` every interval. Resolves only once the lease
    /// no longer holds the record.
    async fn heartbeat_until_lost(&self, lease: &Lease) -> Lost {
        let id = lease.id;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            ticker.tick().await;
            match self.store.heartbeat_many(std::slice::from_ref(lease)).await {
                Ok(report) if report.known.contains(&id) => debug!(%id, "heartbeat"),
                Ok(report) if report.canceled.contains(&id) => return Lost::Canceled,
                Ok(_) | Err(Error::NotFound(_)) => return Lost::Ownership,
                Err(e) => {
                    self.metrics.store_error("heartbeat");
                    warn!(%id, "heartbeat failed: {e}");
                }
            }
        }
    }

    async fn report_success(
        &self,
        record: &Record,
        lease: &Lease,
        span: &tracing::Span,
        duration_ms: f64,
    ) {
        match self.store.mark_complete(lease).await {
            Ok(_) => {
                self.metrics.completed();
                self.metrics.duration("completed", duration_ms);
                record_state_transition(span, State::Processing, State::Completed);
                record_outcome(span, "completed");
                info!(id = %record.id, duration_ms, "record completed");
            }
            Err(e) => self.report_store_error(record.id, "mark_complete", e),
        }
    }

    async fn report_failure(
        &self,
        record: &Record,
        lease: &Lease,
        message: &str,
        span: &tracing::Span,
        duration_ms: f64,
    ) {
        let retry = &self.config.retry;
        if retry.should_retry(record.num_failures) {
            let process_after = retry.next_attempt_at(record.num_failures);
            match self
                .store
                .mark_errored(lease, message, process_after)
                .await
            {
                Ok(()) => {
                    self.metrics.errored();
                    self.metrics.duration("errored", duration_ms);
                    record_state_transition(span, State::Processing, State::Errored);
                    record_outcome(span, "errored");
                    warn!(
                        id = %record.id,
                        attempt = record.num_failures + 1,
                        %process_after,
                        error = message,
                        "record errored, will retry"
                    );
                }
                Err(e) => self.report_store_error(record.id, "mark_errored", e),
            }
        } else {
            match self.store.mark_failed(lease, message).await {
                Ok(()) => {
                    self.metrics.failed();
                    self.metrics.duration("failed", duration_ms);
                    record_state_transition(span, State::Processing, State::Failed);
                    record_outcome(span, "failed");
                    error!(
                        id = %record.id,
                        attempts = record.num_failures + 1,
                        error = message,
                        "record failed"
                    );
                }
                Err(e) => self.report_store_error(record.id, "mark_failed", e),
            }
        }
    }

    fn report_store_error(&self, id: RecordId, operation: &'static str, e: Error) {
        match e {
            Error::OwnershipLost { .. } => {
                self.metrics.ownership_lost();
                warn!(%id, operation, "ownership lost before outcome was recorded");
            }
            e => {
                self.metrics.store_error(operation);
                error!(%id, operation, "could not record outcome: {e}");
            }
        }
    }
}

/// Why a running record slipped out of its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lost {
    Canceled,
    Ownership,
}

/// `None` on success; otherwise the text to store as the failure message.
/// Panics are recovered here and treated like handler errors.
fn failure_message(joined: Result<anyhow::Result<()>, JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Some(format!("handler panicked: {detail}"))
        }
        Err(e) => Some(format!("handler task did not finish: {e}")),
    }
}
