#![allow(dead_code)]

use std::sync::{Arc, Mutex, OnceLock};

use optimistic_txn::config::TransactionConfig;
use optimistic_txn::registry::TransactionRegistry;
use optimistic_txn::transaction::{EventKind, InMemoryRemote, TransactionEvent, TransactionManager};
use optimistic_txn::view::{CacheEntry, DataViewController, InMemoryQueryCache, QueryKey};
use serde_json::{Map, Value};

static TRACING: OnceLock<()> = OnceLock::new();

/// Route engine logs to the test harness once per binary (RUST_LOG to enable)
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn events() -> Vec<Map<String, Value>> {
    vec![
        map(serde_json::json!({"id": "1", "title": "Standup", "room": "A"})),
        map(serde_json::json!({"id": "2", "title": "Review", "room": "B"})),
        map(serde_json::json!({"id": "3", "title": "Retro", "room": "C"})),
    ]
}

pub fn venues() -> Vec<Map<String, Value>> {
    vec![
        map(serde_json::json!({"id": "10", "name": "Main hall"})),
        map(serde_json::json!({"id": "11", "name": "Annex"})),
    ]
}

pub fn config() -> TransactionConfig {
    TransactionConfig::default()
}

pub fn manager(name: &str) -> Arc<TransactionManager> {
    Arc::new(TransactionManager::with_config(name, config()))
}

/// Every event a manager emits, in order
pub fn record(manager: &TransactionManager) -> Arc<Mutex<Vec<TransactionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.on_any(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

pub fn kinds(events: &Arc<Mutex<Vec<TransactionEvent>>>) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(TransactionEvent::kind).collect()
}

/// Seeded remote, warm cache and a registry shared by every mounted view
pub struct Harness {
    pub remote: Arc<InMemoryRemote>,
    pub cache: Arc<InMemoryQueryCache>,
    pub registry: Arc<TransactionRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        init_tracing();
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed("events", events());
        remote.seed("venues", venues());

        let cache = Arc::new(InMemoryQueryCache::new());
        cache.insert(QueryKey::new("events"), CacheEntry::new(events())).await;
        cache.insert(QueryKey::new("venues"), CacheEntry::new(venues())).await;

        Self {
            remote,
            cache,
            registry: Arc::new(TransactionRegistry::new()),
        }
    }

    pub fn mount(&self, view_id: &str, endpoint: &str, config: TransactionConfig) -> DataViewController {
        DataViewController::mount(
            view_id,
            Arc::new(TransactionManager::with_config(endpoint, config)),
            self.cache.clone(),
            QueryKey::new(endpoint),
            Some(self.registry.clone()),
        )
    }
}
