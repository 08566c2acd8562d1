//! Registry of named queues served to executors.
//!
//! Built once at startup and shared by reference; there is no global queue
//! table. Each entry pairs a record store with the credential executors must
//! present and the queue-specific shaping of dequeued jobs.

use secrecy::SecretString;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::secrets::token_matches;
use crate::error::{Error, Result};
use crate::model::{ClaimFilter, Record};
use crate::store::Store;
use crate::telemetry::metrics::QueueMetrics;

/// Adds queue-specific metadata to a dequeued record, e.g. pre-resolved
/// fetch URLs the executor needs and cannot compute itself.
pub trait RecordTransformer: Send + Sync {
    fn transform(&self, record: &Record) -> Result<serde_json::Value>;
}

impl<F> RecordTransformer for F
where
    F: Fn(&Record) -> Result<serde_json::Value> + Send + Sync,
{
    fn transform(&self, record: &Record) -> Result<serde_json::Value> {
        self(record)
    }
}

/// One named queue as seen by the proxy.
pub struct QueueHandle {
    pub(crate) store: Arc<dyn Store>,
    access_token: SecretString,
    pub(crate) filter: ClaimFilter,
    pub(crate) transformer: Option<Arc<dyn RecordTransformer>>,
    pub(crate) metrics: QueueMetrics,
}

impl QueueHandle {
    pub fn new(store: Arc<dyn Store>, access_token: SecretString) -> Self {
        let metrics = QueueMetrics::new(store.queue());
        Self {
            store,
            access_token,
            filter: ClaimFilter::any(),
            transformer: None,
            metrics,
        }
    }

    pub fn filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn RecordTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn name(&self) -> &str {
        self.store.queue()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Check a presented bearer token against this queue's credential.
    pub fn authenticate(&self, token: &str) -> Result<()> {
        if token_matches(&self.access_token, token) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }
}

/// Name → queue map.
#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, QueueHandle>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue under its store's name. Names must be unique.
    pub fn register(&mut self, handle: QueueHandle) -> Result<()> {
        let name = handle.name().to_string();
        if self.queues.contains_key(&name) {
            return Err(Error::Config(format!("queue {name} registered twice")));
        }
        self.queues.insert(name, handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&QueueHandle> {
        self.queues
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("queue {name}")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn handles(&self) -> impl Iterator<Item = &QueueHandle> {
        self.queues.values()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn handle(name: &str) -> QueueHandle {
        QueueHandle::new(
            Arc::new(MemoryStore::new(name)),
            SecretString::from("s3cret"),
        )
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = QueueRegistry::new();
        registry.register(handle("codeintel")).unwrap();
        registry.register(handle("batches")).unwrap();

        assert_eq!(registry.get("batches").unwrap().name(), "batches");
        assert!(matches!(
            registry.get("insights"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), ["batches", "codeintel"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = QueueRegistry::new();
        registry.register(handle("codeintel")).unwrap();
        assert!(matches!(
            registry.register(handle("codeintel")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn authenticate_checks_token() {
        let h = handle("codeintel");
        assert!(h.authenticate("s3cret").is_ok());
        assert!(matches!(h.authenticate("guess"), Err(Error::Unauthorized)));
        assert!(matches!(h.authenticate(""), Err(Error::Unauthorized)));
    }
}
