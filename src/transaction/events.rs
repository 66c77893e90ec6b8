use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::TransactionError;
use crate::transaction::operation::Operation;
use crate::transaction::pending::PendingState;
use crate::transaction::result::{OperationResult, TransactionStatus};
use crate::types::{EntityId, OperationId, TransactionId};

/// Lifecycle events emitted by a transaction manager
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    OperationAdded {
        transaction_id: TransactionId,
        operation: Operation,
        /// Entity's pending state after the add
        pending: Option<PendingState>,
    },
    OperationRemoved {
        transaction_id: TransactionId,
        operation: Operation,
        /// Entity's pending state recomputed from what is still queued
        pending: Option<PendingState>,
    },
    TransactionStart {
        transaction_id: TransactionId,
        operation_count: usize,
    },
    OperationComplete {
        transaction_id: TransactionId,
        result: OperationResult,
    },
    TransactionComplete {
        transaction_id: TransactionId,
        status: TransactionStatus,
        results: Vec<OperationResult>,
    },
    TransactionError {
        transaction_id: TransactionId,
        operation_id: OperationId,
        entity_id: EntityId,
        error: TransactionError,
    },
    RollbackComplete {
        transaction_id: TransactionId,
        results: Vec<OperationResult>,
    },
    TransactionCancelled {
        transaction_id: TransactionId,
        discarded: Vec<Operation>,
    },
}

/// Event names for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OperationAdded,
    OperationRemoved,
    TransactionStart,
    OperationComplete,
    TransactionComplete,
    TransactionError,
    RollbackComplete,
    TransactionCancelled,
}

impl TransactionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransactionEvent::OperationAdded { .. } => EventKind::OperationAdded,
            TransactionEvent::OperationRemoved { .. } => EventKind::OperationRemoved,
            TransactionEvent::TransactionStart { .. } => EventKind::TransactionStart,
            TransactionEvent::OperationComplete { .. } => EventKind::OperationComplete,
            TransactionEvent::TransactionComplete { .. } => EventKind::TransactionComplete,
            TransactionEvent::TransactionError { .. } => EventKind::TransactionError,
            TransactionEvent::RollbackComplete { .. } => EventKind::RollbackComplete,
            TransactionEvent::TransactionCancelled { .. } => EventKind::TransactionCancelled,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionEvent::OperationAdded { transaction_id, .. }
            | TransactionEvent::OperationRemoved { transaction_id, .. }
            | TransactionEvent::TransactionStart { transaction_id, .. }
            | TransactionEvent::OperationComplete { transaction_id, .. }
            | TransactionEvent::TransactionComplete { transaction_id, .. }
            | TransactionEvent::TransactionError { transaction_id, .. }
            | TransactionEvent::RollbackComplete { transaction_id, .. }
            | TransactionEvent::TransactionCancelled { transaction_id, .. } => *transaction_id,
        }
    }
}

// ========================================
// Publish/subscribe
// ========================================

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous observer list with typed payloads.
///
/// Listeners run on the emitting thread, after the bus lock is released, in
/// subscription order. A listener removed mid-emit is not called.
pub struct EventBus<E> {
    listeners: Mutex<HashMap<SubscriptionId, Listener<E>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Listener<E>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners().remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.listeners().contains_key(&id)
    }

    /// Deliver `event` to every listener; returns how many were called
    pub fn emit(&self, event: &E) -> usize {
        let mut snapshot: Vec<(SubscriptionId, Listener<E>)> =
            self.listeners().iter().map(|(id, l)| (*id, l.clone())).collect();
        snapshot.sort_by_key(|(id, _)| *id);

        let mut delivered = 0;
        for (id, listener) in snapshot {
            if !self.is_subscribed(id) {
                tracing::trace!("Listener {} unsubscribed during emit, skipping", id);
                continue;
            }
            listener(event);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners().clear();
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.len()).finish()
    }
}

/// Detaches one listener from a shared bus
#[must_use = "dropping the handle keeps the listener attached"]
pub struct Unsubscribe<E> {
    bus: Weak<EventBus<E>>,
    id: SubscriptionId,
}

impl<E> Unsubscribe<E> {
    pub fn new(bus: &Arc<EventBus<E>>, id: SubscriptionId) -> Self {
        Self { bus: Arc::downgrade(bus), id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns false when the listener was already gone
    pub fn unsubscribe(self) -> bool {
        self.bus.upgrade().map(|bus| bus.unsubscribe(self.id)).unwrap_or(false)
    }
}

impl<E> fmt::Debug for Unsubscribe<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}
