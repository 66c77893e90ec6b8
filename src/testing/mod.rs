use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use crate::config::TransactionConfig;
use crate::registry::TransactionRegistry;
use crate::transaction::{EventKind, InMemoryRemote, TransactionEvent, TransactionManager};
use crate::view::{CacheEntry, DataViewController, InMemoryQueryCache, QueryKey};

/// JSON object literal to a field map
pub fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Three existing events, ids 1..=3
pub fn events_fixture() -> Vec<Map<String, Value>> {
    vec![
        map(serde_json::json!({"id": "1", "title": "Standup", "room": "A"})),
        map(serde_json::json!({"id": "2", "title": "Review", "room": "B"})),
        map(serde_json::json!({"id": "3", "title": "Retro", "room": "C"})),
    ]
}

/// Listener recording the kind of every event it sees
pub fn recorder() -> (Arc<Mutex<Vec<EventKind>>>, impl Fn(&TransactionEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &TransactionEvent| sink.lock().unwrap().push(event.kind()))
}

/// A seeded remote, a warm cache and a registry, shared by mounted views
pub struct TestContext {
    pub remote: Arc<InMemoryRemote>,
    pub cache: Arc<InMemoryQueryCache>,
    pub registry: Arc<TransactionRegistry>,
}

impl TestContext {
    pub async fn new() -> Self {
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed("events", events_fixture());
        let cache = Arc::new(InMemoryQueryCache::new());
        cache.insert(QueryKey::new("events"), CacheEntry::new(events_fixture())).await;

        Self {
            remote,
            cache,
            registry: Arc::new(TransactionRegistry::new()),
        }
    }

    /// Mount a registered view over `endpoint` with its own manager
    pub fn mount(&self, view_id: &str, endpoint: &str, config: TransactionConfig) -> DataViewController {
        let manager = Arc::new(TransactionManager::with_config(endpoint, config));
        DataViewController::mount(
            view_id,
            manager,
            self.cache.clone(),
            QueryKey::new(endpoint),
            Some(self.registry.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_mounts_registered_views() {
        let ctx = TestContext::new().await;
        let view = ctx.mount("events-table", "events", TransactionConfig::default());

        assert_eq!(ctx.registry.len(), 1);
        assert_eq!(view.rows().await.unwrap().len(), 3);
        assert_eq!(ctx.remote.rows("events").len(), 3);

        view.unmount();
        assert!(ctx.registry.is_empty());
    }
}
