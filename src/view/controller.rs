//! Glue between a data view, its query cache and its transaction manager.
//!
//! The controller applies optimistic creates to the cache, snapshots each
//! query key before the first change so a cancel can restore it exactly, and
//! reconciles the cache when a transaction ends. Manager events reach it
//! through an inbox that is drained after every controller action and by
//! [`DataViewController::sync`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::entity::{merge_fields, ID_FIELD};
use crate::error::{Result, TransactionError};
use crate::registry::TransactionRegistry;
use crate::transaction::{
    CommitOutcome, Mutation, Operation, OperationOutcome, PendingKind, PendingState, SubscriptionId,
    TransactionEvent, TransactionManager,
};
use crate::types::{EntityId, OperationId, OperationKind, Trigger};
use crate::view::cache::{CacheEntry, QueryCache, QueryKey};

/// A cached row as the view should draw it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedRow {
    pub id: EntityId,
    /// Cached row with pending data merged over it
    pub data: Map<String, Value>,
    pub state: Option<PendingKind>,
    pub selected: bool,
}

/// A mounted data view.
///
/// Manager events are applied when the controller itself acts and on
/// [`sync`](Self::sync). After registry-wide actions (`commit_all`,
/// `cancel_all`) the host must call `sync()` on each mounted view, otherwise
/// its cache keeps the optimistic rows and stale snapshots until the next
/// controller action.
pub struct DataViewController {
    view_id: String,
    manager: Arc<TransactionManager>,
    cache: Arc<dyn QueryCache>,
    registry: Option<Arc<TransactionRegistry>>,
    query_key: QueryKey,
    /// Cache contents per key before the first change; `None` means the key was absent
    snapshots: HashMap<QueryKey, Option<CacheEntry>>,
    /// Key each optimistic create was inserted into
    optimistic_rows: HashMap<EntityId, QueryKey>,
    selection: BTreeSet<EntityId>,
    render_version: u64,
    inbox: mpsc::UnboundedReceiver<TransactionEvent>,
    subscription: Option<SubscriptionId>,
}

impl DataViewController {
    /// Attach a view to `manager`, registering it under `view_id` when a registry is given
    pub fn mount(
        view_id: impl Into<String>,
        manager: Arc<TransactionManager>,
        cache: Arc<dyn QueryCache>,
        query_key: QueryKey,
        registry: Option<Arc<TransactionRegistry>>,
    ) -> Self {
        let view_id = view_id.into();
        let (sender, inbox) = mpsc::unbounded_channel();
        let subscription = manager.on_any(move |event| {
            // receiver gone means the view unmounted
            let _ = sender.send(event.clone());
        });

        if let Some(registry) = &registry {
            registry.register(view_id.clone(), manager.clone());
        }
        tracing::debug!("View {} mounted on {}", view_id, query_key);

        Self {
            view_id,
            manager,
            cache,
            registry,
            query_key,
            snapshots: HashMap::new(),
            optimistic_rows: HashMap::new(),
            selection: BTreeSet::new(),
            render_version: 0,
            inbox,
            subscription: Some(subscription),
        }
    }

    pub fn view_id(&self) -> &str {
        &self.view_id
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Incremented whenever rendered rows may have changed
    pub fn render_version(&self) -> u64 {
        self.render_version
    }

    pub fn has_snapshot(&self, key: &QueryKey) -> bool {
        self.snapshots.contains_key(key)
    }

    // ========================================
    // Editing
    // ========================================

    /// Queue a change made in the view.
    ///
    /// Creates appear in the cache immediately; updates and deletes only
    /// change the pending state the rows are rendered with.
    pub async fn add_transaction_operation(
        &mut self,
        kind: OperationKind,
        entity: Map<String, Value>,
        mutation: Arc<dyn Mutation>,
        trigger: Trigger,
        changed_fields: Option<Vec<String>>,
    ) -> Result<OperationId> {
        let snapshot_taken = self.ensure_snapshot().await?;
        let result = self.enqueue(kind, entity, mutation, trigger, changed_fields).await;

        if result.is_err() && snapshot_taken && !self.manager.has_operations() {
            self.snapshots.remove(&self.query_key);
        }
        self.drain().await?;
        result
    }

    async fn enqueue(
        &mut self,
        kind: OperationKind,
        entity: Map<String, Value>,
        mutation: Arc<dyn Mutation>,
        trigger: Trigger,
        changed_fields: Option<Vec<String>>,
    ) -> Result<OperationId> {
        let endpoint = self.query_key.endpoint.clone();
        let cached = self.cache.read(&self.query_key).await?;

        let op = match kind {
            OperationKind::Create => Operation::create(endpoint, entity, mutation),
            OperationKind::Update | OperationKind::Delete => {
                let id = entity
                    .get(ID_FIELD)
                    .and_then(EntityId::from_value)
                    .ok_or_else(|| TransactionError::invalid_state(format!("{} needs an entity id", kind)))?;
                let original = cached.as_ref().and_then(|entry| entry.find(&id)).cloned();

                let mut op = if kind == OperationKind::Update {
                    Operation::update(endpoint, id, entity, mutation)
                } else {
                    Operation::delete(endpoint, id, mutation)
                };
                if let Some(original) = original {
                    op = op.with_original(original);
                }
                if let Some(fields) = changed_fields {
                    op = op.with_changed_fields(fields);
                }
                op
            }
        };
        let op = op.with_trigger(trigger);

        let row = (op.kind == OperationKind::Create).then(|| (op.entity_id.clone(), op.entity.clone()));
        let id = self.manager.add_operation(op, None)?;

        if let Some((entity_id, row)) = row {
            self.insert_optimistic_row(entity_id, row).await?;
        }
        Ok(id)
    }

    /// Put a created row at the head of the current page
    async fn insert_optimistic_row(&mut self, entity_id: EntityId, row: Map<String, Value>) -> Result<()> {
        let current = self.query_key.clone();
        let key = self.optimistic_rows.entry(entity_id.clone()).or_insert(current).clone();
        self.cache
            .write(
                &key,
                Box::new(move |entry| {
                    let mut entry = entry.unwrap_or_default();
                    if entry.position(&entity_id).is_none() {
                        entry.rows.insert(0, row);
                        entry.total += 1;
                    }
                    Some(entry)
                }),
            )
            .await?;
        Ok(())
    }

    pub fn get_pending_data(&self, entity_id: &EntityId) -> Option<Map<String, Value>> {
        self.manager.get_pending_data(entity_id)
    }

    pub fn pending_state(&self, entity_id: &EntityId) -> Option<PendingState> {
        self.manager.pending_state(entity_id)
    }

    /// Undo one queued change; false when `id` is no longer the entity's current operation
    pub async fn remove_operation(&mut self, id: OperationId) -> Result<bool> {
        let removed = self.manager.remove_operation(id);
        self.drain().await?;
        Ok(removed)
    }

    /// Confirm the queued changes before a commit that requires it
    pub fn review(&mut self) -> Result<()> {
        self.manager.mark_reviewing()
    }

    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        let outcome = self.manager.commit(false).await;
        self.drain().await?;
        outcome
    }

    pub async fn cancel(&mut self) -> Result<()> {
        let cancelled = self.manager.cancel();
        self.drain().await?;
        cancelled
    }

    // ========================================
    // Rendering and selection
    // ========================================

    /// Rows of the current query with pending changes applied
    pub async fn rows(&self) -> Result<Vec<RenderedRow>> {
        let Some(entry) = self.cache.read(&self.query_key).await? else {
            return Ok(Vec::new());
        };

        let pending = self.manager.pending_states();
        let rows = entry
            .rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get(ID_FIELD).and_then(EntityId::from_value)?;
                let state = pending.get(&id);
                let data = match state {
                    Some(p) if p.state != PendingKind::Deleted => merge_fields(&row, &p.data),
                    _ => row,
                };
                Some(RenderedRow {
                    selected: self.selection.contains(&id),
                    state: state.map(|p| p.state),
                    id,
                    data,
                })
            })
            .collect();
        Ok(rows)
    }

    pub fn select(&mut self, id: impl Into<EntityId>) -> bool {
        let added = self.selection.insert(id.into());
        if added {
            self.render_version += 1;
        }
        added
    }

    pub fn deselect(&mut self, id: &EntityId) -> bool {
        let removed = self.selection.remove(id);
        if removed {
            self.render_version += 1;
        }
        removed
    }

    pub fn selection(&self) -> Vec<EntityId> {
        self.selection.iter().cloned().collect()
    }

    /// Switch page or filters; snapshots of other keys are kept
    pub fn set_query_key(&mut self, key: QueryKey) {
        if key != self.query_key {
            tracing::debug!("View {} switching to {}", self.view_id, key);
            self.query_key = key;
            self.render_version += 1;
        }
    }

    // ========================================
    // Event reconciliation
    // ========================================

    /// Reconcile events caused outside this controller (e.g. a registry-wide
    /// commit); returns how many were processed
    pub async fn sync(&mut self) -> Result<usize> {
        self.drain().await
    }

    async fn drain(&mut self) -> Result<usize> {
        let mut processed = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.reconcile(event).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn reconcile(&mut self, event: TransactionEvent) -> Result<()> {
        match event {
            TransactionEvent::OperationAdded { .. } => {
                self.render_version += 1;
            }
            TransactionEvent::OperationRemoved { operation, pending, .. } => {
                if operation.kind == OperationKind::Create && pending.is_none() {
                    self.remove_optimistic_row(operation.entity_id).await?;
                }
                self.render_version += 1;
            }
            TransactionEvent::TransactionStart { .. } => {
                self.ensure_snapshot().await?;
            }
            TransactionEvent::TransactionCancelled { discarded, .. } => {
                self.restore_snapshots().await?;
                self.optimistic_rows.clear();
                self.prune_selection(|id| id.is_temporary());
                tracing::debug!("View {} restored after discarding {} operations", self.view_id, discarded.len());
                self.render_version += 1;
            }
            TransactionEvent::TransactionComplete { results, .. } => {
                self.cache.invalidate(&self.query_key.prefix()).await?;
                self.snapshots.clear();
                self.optimistic_rows.clear();
                let deleted: BTreeSet<EntityId> = results
                    .iter()
                    .filter(|r| r.kind == OperationKind::Delete && r.outcome == OperationOutcome::Applied)
                    .map(|r| r.entity_id.clone())
                    .collect();
                self.prune_selection(|id| id.is_temporary() || deleted.contains(id));
                self.render_version += 1;
            }
            TransactionEvent::RollbackComplete { .. } => {
                self.cache.invalidate(&self.query_key.prefix()).await?;
                self.render_version += 1;
            }
            TransactionEvent::OperationComplete { .. } | TransactionEvent::TransactionError { .. } => {}
        }
        Ok(())
    }

    /// Snapshot the current key unless one is held; true when a snapshot was taken
    async fn ensure_snapshot(&mut self) -> Result<bool> {
        if self.snapshots.contains_key(&self.query_key) {
            return Ok(false);
        }
        let entry = self.cache.read(&self.query_key).await?;
        tracing::trace!("View {} snapshot of {}", self.view_id, self.query_key);
        self.snapshots.insert(self.query_key.clone(), entry);
        Ok(true)
    }

    async fn restore_snapshots(&mut self) -> Result<()> {
        for (key, snapshot) in self.snapshots.drain() {
            self.cache.write(&key, Box::new(move |_| snapshot)).await?;
        }
        Ok(())
    }

    /// Take an undone create out of the key it was inserted into
    async fn remove_optimistic_row(&mut self, entity_id: EntityId) -> Result<()> {
        let key = self.optimistic_rows.remove(&entity_id).unwrap_or_else(|| self.query_key.clone());
        self.cache
            .write(
                &key,
                Box::new(move |entry| {
                    let mut entry = entry?;
                    if let Some(i) = entry.position(&entity_id) {
                        entry.rows.remove(i);
                        entry.total = entry.total.saturating_sub(1);
                    }
                    Some(entry)
                }),
            )
            .await?;
        Ok(())
    }

    fn prune_selection(&mut self, prune: impl Fn(&EntityId) -> bool) {
        self.selection.retain(|id| !prune(id));
    }

    // ========================================
    // Teardown
    // ========================================

    fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.manager.off(subscription);
            if let Some(registry) = &self.registry {
                registry.unregister(&self.view_id);
            }
            tracing::debug!("View {} unmounted", self.view_id);
        }
    }

    /// Stop listening to the manager and leave the registry
    pub fn unmount(mut self) {
        self.detach();
    }
}

impl Drop for DataViewController {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for DataViewController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataViewController")
            .field("view_id", &self.view_id)
            .field("query_key", &self.query_key)
            .field("snapshots", &self.snapshots.len())
            .field("selection", &self.selection)
            .field("render_version", &self.render_version)
            .finish_non_exhaustive()
    }
}
