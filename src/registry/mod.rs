// Registry of live transaction managers for app-wide save/discard
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, TransactionError};
use crate::transaction::{CommitOutcome, EventBus, SubscriptionId, TransactionEvent, TransactionManager, TransactionSummary, Unsubscribe};

/// A manager event, tagged with the id the manager was registered under
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub manager_id: String,
    pub event: TransactionEvent,
}

struct Registration {
    manager: Arc<TransactionManager>,
    /// Forwarding subscription on the manager
    subscription: SubscriptionId,
}

/// Tracks every mounted manager.
///
/// Constructed explicitly and shared as `Arc`. The registry only calls public
/// manager operations; it never reaches into a manager's queue.
pub struct TransactionRegistry {
    managers: RwLock<BTreeMap<String, Registration>>,
    events: Arc<EventBus<RegistryEvent>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(BTreeMap::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Registration>> {
        self.managers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Registration>> {
        self.managers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `manager` under `id`, replacing any earlier registration for that id
    pub fn register(&self, id: impl Into<String>, manager: Arc<TransactionManager>) {
        let id = id.into();

        let bus = Arc::downgrade(&self.events);
        let manager_id = id.clone();
        let subscription = manager.on_any(move |event| {
            if let Some(bus) = bus.upgrade() {
                bus.emit(&RegistryEvent {
                    manager_id: manager_id.clone(),
                    event: event.clone(),
                });
            }
        });

        let previous = self.write().insert(id.clone(), Registration { manager, subscription });
        if let Some(previous) = previous {
            previous.manager.off(previous.subscription);
            tracing::debug!("Registry replaced manager {}", id);
        } else {
            tracing::debug!("Registry registered manager {}", id);
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        match removed {
            Some(registration) => {
                registration.manager.off(registration.subscription);
                tracing::debug!("Registry unregistered manager {}", id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<TransactionManager>> {
        self.read().get(id).map(|r| r.manager.clone())
    }

    /// Registered managers ordered by id
    pub fn get_all_managers(&self) -> Vec<(String, Arc<TransactionManager>)> {
        self.read()
            .iter()
            .map(|(id, r)| (id.clone(), r.manager.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sum of every manager's summary
    pub fn get_combined_summary(&self) -> TransactionSummary {
        let mut combined = TransactionSummary::default();
        for (_, manager) in self.get_all_managers() {
            combined.absorb(&manager.get_summary());
        }
        combined
    }

    /// Queued operations across all managers
    pub fn total_pending(&self) -> usize {
        self.get_all_managers()
            .iter()
            .map(|(_, manager)| manager.operation_count())
            .sum()
    }

    /// Listen for events from every registered manager
    pub fn add_listener(&self, listener: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> Unsubscribe<RegistryEvent> {
        let id = self.events.subscribe(listener);
        Unsubscribe::new(&self.events, id)
    }

    pub fn listener_count(&self) -> usize {
        self.events.len()
    }

    /// Commit every manager that has queued operations, concurrently.
    ///
    /// One manager failing never stops the others; each gets its own result.
    pub async fn commit_all(&self) -> BTreeMap<String, Result<CommitOutcome>> {
        let targets: Vec<(String, Arc<TransactionManager>)> = self
            .get_all_managers()
            .into_iter()
            .filter(|(_, manager)| manager.has_operations())
            .collect();

        tracing::info!("Registry committing {} managers", targets.len());

        let outcomes = join_all(targets.iter().map(|(_, manager)| manager.commit(false))).await;

        let results: BTreeMap<String, Result<CommitOutcome>> = targets
            .into_iter()
            .map(|(id, _)| id)
            .zip(outcomes)
            .collect();

        for (id, result) in &results {
            match result {
                Ok(outcome) if outcome.has_failures() => {
                    tracing::warn!("Manager {} committed with {} failures", id, outcome.failures().count());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Manager {} could not commit: {}", id, e),
            }
        }
        results
    }

    /// Cancel every manager that has queued operations; returns the managers that refused
    pub fn cancel_all(&self) -> Vec<(String, TransactionError)> {
        let mut errors = Vec::new();
        for (id, manager) in self.get_all_managers() {
            if !manager.has_operations() {
                continue;
            }
            if let Err(e) = manager.cancel() {
                tracing::warn!("Manager {} could not cancel: {}", id, e);
                errors.push((id, e));
            }
        }
        errors
    }

    /// Unregister every manager and drop all listeners
    pub fn dispose(&self) {
        let registrations = std::mem::take(&mut *self.write());
        for (_, registration) in registrations {
            registration.manager.off(registration.subscription);
        }
        self.events.clear();
        tracing::debug!("Registry disposed");
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransactionRegistry {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("managers", &self.read().keys().collect::<Vec<_>>())
            .field("listeners", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::testing::events_fixture;
    use crate::transaction::{EventKind, InMemoryRemote, Operation};
    use std::sync::Mutex;

    fn manager(name: &str) -> Arc<TransactionManager> {
        Arc::new(TransactionManager::with_config(name, TransactionConfig::default()))
    }

    #[test]
    fn test_register_and_replace() {
        let registry = TransactionRegistry::new();
        let first = manager("events");
        registry.register("events", first.clone());
        assert_eq!(first.listener_count(), 1);

        let second = manager("events");
        registry.register("events", second.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(first.listener_count(), 0);
        assert!(Arc::ptr_eq(&registry.get("events").unwrap(), &second));

        assert!(registry.unregister("events"));
        assert!(!registry.unregister("events"));
        assert_eq!(second.listener_count(), 0);
    }

    #[test]
    fn test_forwards_events_with_manager_id() {
        let registry = TransactionRegistry::new();
        let events = manager("events");
        registry.register("events-view", events.clone());

        let seen: Arc<Mutex<Vec<(String, EventKind)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let handle = registry.add_listener(move |e| s.lock().unwrap().push((e.manager_id.clone(), e.event.kind())));

        let remote = Arc::new(InMemoryRemote::new());
        events.add_operation(Operation::delete("events", "1", remote.clone()), None).unwrap();
        assert!(handle.unsubscribe());
        events.add_operation(Operation::delete("events", "2", remote), None).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("events-view".to_string(), EventKind::OperationAdded)]
        );
    }

    #[test]
    fn test_combined_summary_and_cancel_all() {
        let registry = TransactionRegistry::new();
        let (a, b) = (manager("events"), manager("venues"));
        registry.register("a", a.clone());
        registry.register("b", b.clone());

        let remote = Arc::new(InMemoryRemote::new());
        a.add_operation(Operation::delete("events", "1", remote.clone()), None).unwrap();
        b.add_operation(Operation::delete("venues", "1", remote.clone()), None).unwrap();
        b.add_operation(Operation::delete("venues", "2", remote), None).unwrap();

        let summary = registry.get_combined_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.deletes, 3);
        assert_eq!(summary.entity_type_count(), 2);
        assert_eq!(registry.total_pending(), 3);

        assert!(registry.cancel_all().is_empty());
        assert_eq!(registry.total_pending(), 0);
    }

    #[tokio::test]
    async fn test_commit_all_skips_idle_managers() {
        let registry = TransactionRegistry::new();
        let (busy, idle) = (manager("events"), manager("venues"));
        registry.register("busy", busy.clone());
        registry.register("idle", idle);

        let remote = Arc::new(InMemoryRemote::new());
        remote.seed("events", events_fixture());
        busy.add_operation(Operation::delete("events", "1", remote), None).unwrap();

        let results = registry.commit_all().await;
        assert_eq!(results.len(), 1);
        assert!(results["busy"].as_ref().unwrap().results[0].success());
    }

    #[test]
    fn test_dispose_detaches_everything() {
        let registry = TransactionRegistry::new();
        let events = manager("events");
        registry.register("events", events.clone());
        let _handle = registry.add_listener(|_| {});

        registry.dispose();
        assert!(registry.is_empty());
        assert_eq!(registry.listener_count(), 0);
        assert_eq!(events.listener_count(), 0);
    }
}
