// Transaction manager: one ordered operation queue for one entity collection
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::config::TransactionConfig;
use crate::error::{MutationError, Result, TransactionError};
use crate::transaction::events::{EventBus, EventKind, SubscriptionId, TransactionEvent};
use crate::transaction::mutation::{Mutation, MutationRequest};
use crate::transaction::operation::Operation;
use crate::transaction::pending::{
    plan_commit, plan_compensation, replay, resolve, EntityPlan, PendingState, Resolution, SkipReason,
};
use crate::transaction::result::{
    CommitOutcome, OperationOutcome, OperationResult, Transaction, TransactionStatus, TransactionSummary,
};
use crate::types::{EntityId, OperationId, OperationKind, TransactionId};

#[derive(Debug, Default)]
struct ManagerState {
    /// Transaction accepting or executing operations
    active: Option<Transaction>,
    /// Net state per entity for the active transaction
    pending: HashMap<EntityId, PendingState>,
    /// Most recent committed, cancelled or rolled back transaction
    last: Option<Transaction>,
}

/// Owns the operation queue and pending states of one collection.
///
/// All state sits behind a mutex that is never held across an await or while
/// listeners run, so listeners may call back into the manager.
pub struct TransactionManager {
    name: String,
    default_config: TransactionConfig,
    state: Mutex<ManagerState>,
    events: EventBus<TransactionEvent>,
}

impl TransactionManager {
    /// Manager using the application's transaction defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, crate::config::config().transaction.clone())
    }

    pub fn with_config(name: impl Into<String>, config: TransactionConfig) -> Self {
        Self {
            name: name.into(),
            default_config: config,
            state: Mutex::new(ManagerState::default()),
            events: EventBus::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_config(&self) -> &TransactionConfig {
        &self.default_config
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransactionEvent) {
        if crate::config::config().logging.log_events {
            tracing::info!("Manager {} event {:?} ({})", self.name, event.kind(), event.transaction_id());
        } else {
            tracing::trace!("Manager {} emitting {:?}", self.name, event.kind());
        }
        self.events.emit(&event);
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Start a transaction unless one is active; returns the active id either way
    pub fn begin(&self, config: Option<TransactionConfig>) -> Result<TransactionId> {
        let mut state = self.state();
        if let Some(tx) = &state.active {
            return Ok(tx.id);
        }

        let tx = Transaction::new(config.unwrap_or_else(|| self.default_config.clone()));
        let id = tx.id;
        state.active = Some(tx);
        tracing::info!("Manager {} began transaction {}", self.name, id);
        Ok(id)
    }

    /// Start a transaction with exactly `config`; an active one with a different config is an error
    pub fn begin_fresh(&self, config: TransactionConfig) -> Result<TransactionId> {
        {
            let state = self.state();
            if let Some(tx) = &state.active {
                if tx.config != config {
                    return Err(TransactionError::AlreadyActive(tx.id));
                }
                return Ok(tx.id);
            }
        }
        self.begin(Some(config))
    }

    /// Queue an operation, collapsing it with earlier ones on the same entity.
    ///
    /// Returns the id that is authoritative for the entity afterwards. A
    /// redundant delete queues nothing and returns the existing delete's id.
    pub fn add_operation(&self, op: Operation, explicit_id: Option<OperationId>) -> Result<OperationId> {
        let mut op = op;
        if let Some(id) = explicit_id {
            op.id = id;
        }

        let (event, op_id) = {
            let mut state = self.state();
            let ManagerState { active, pending, .. } = &mut *state;

            let config = match active {
                Some(tx) if tx.status == TransactionStatus::Executing => {
                    return Err(TransactionError::invalid_state(
                        "cannot add operations while the transaction is executing",
                    ));
                }
                Some(tx) => {
                    if tx.operation(op.id).is_some() {
                        return Err(TransactionError::invalid_state(format!(
                            "operation {} is already queued",
                            op.id
                        )));
                    }
                    tx.config.clone()
                }
                None => self.default_config.clone(),
            };

            let queued_ops = active.as_ref().map(|tx| tx.operations.as_slice()).unwrap_or_default();
            let created = queued_ops
                .iter()
                .any(|o| o.entity_id == op.entity_id && o.kind == OperationKind::Create);

            let prior = pending.get(&op.entity_id);
            let next = match resolve(prior, &op, created)? {
                Resolution::Apply(next) => next,
                Resolution::Ignore => {
                    let existing = prior.map(|p| p.operation_id).unwrap_or(op.id);
                    tracing::debug!(
                        "Manager {}: redundant {} for {} ignored (kept {})",
                        self.name, op.kind, op.entity_id, existing
                    );
                    return Ok(existing);
                }
            };

            if queued_ops.len() >= config.max_pending_operations {
                tracing::warn!(
                    "Manager {}: capacity of {} pending operations reached",
                    self.name, config.max_pending_operations
                );
                return Err(TransactionError::CapacityExceeded { max: config.max_pending_operations });
            }

            let tx = active.get_or_insert_with(|| {
                let tx = Transaction::new(config);
                tracing::info!("Manager {} began transaction {}", self.name, tx.id);
                tx
            });
            // A review covers only what was queued when it happened
            if tx.status == TransactionStatus::Reviewing {
                tx.status = TransactionStatus::Pending;
            }

            tracing::debug!(
                "Manager {}: queued {} ({}) -> {:?}",
                self.name, op.label, op.id, next.state
            );

            let op_id = op.id;
            pending.insert(op.entity_id.clone(), next.clone());
            tx.operations.push(op.clone());

            let event = TransactionEvent::OperationAdded {
                transaction_id: tx.id,
                operation: op,
                pending: Some(next),
            };
            (event, op_id)
        };

        self.emit(event);
        Ok(op_id)
    }

    /// Undo a queued operation if it is still the entity's current one.
    ///
    /// A superseded id is stale: nothing changes and false is returned.
    pub fn remove_operation(&self, id: OperationId) -> bool {
        let event = {
            let mut state = self.state();
            let ManagerState { active, pending, .. } = &mut *state;

            let Some(tx) = active.as_mut() else {
                return false;
            };
            if tx.status == TransactionStatus::Executing {
                tracing::warn!("Manager {}: cannot remove {} while executing", self.name, id);
                return false;
            }
            let Some(index) = tx.operations.iter().position(|op| op.id == id) else {
                return false;
            };

            let entity_id = tx.operations[index].entity_id.clone();
            if pending.get(&entity_id).map(|p| p.operation_id) != Some(id) {
                tracing::debug!("Manager {}: remove of superseded operation {} ignored", self.name, id);
                return false;
            }

            let operation = tx.operations.remove(index);
            let recomputed = replay(tx.operations.iter().filter(|op| op.entity_id == entity_id));
            match &recomputed {
                Some(next) => {
                    pending.insert(entity_id, next.clone());
                }
                None => {
                    pending.remove(&entity_id);
                }
            }
            if tx.status == TransactionStatus::Reviewing {
                tx.status = TransactionStatus::Pending;
            }

            tracing::debug!("Manager {}: removed {} ({})", self.name, operation.label, operation.id);
            TransactionEvent::OperationRemoved {
                transaction_id: tx.id,
                operation,
                pending: recomputed,
            }
        };

        self.emit(event);
        true
    }

    /// Move the active transaction into review (required before commit when
    /// `require_confirmation` is set)
    pub fn mark_reviewing(&self) -> Result<()> {
        let mut state = self.state();
        let tx = state
            .active
            .as_mut()
            .ok_or_else(|| TransactionError::invalid_state("no active transaction to review"))?;

        match tx.status {
            TransactionStatus::Pending if !tx.operations.is_empty() => {
                tx.status = TransactionStatus::Reviewing;
                Ok(())
            }
            TransactionStatus::Pending => Err(TransactionError::invalid_state("nothing to review")),
            TransactionStatus::Reviewing => Ok(()),
            status => Err(TransactionError::invalid_state(format!(
                "cannot review a transaction that is {:?}",
                status
            ))),
        }
    }

    /// Execute every queued operation's net remote effect.
    ///
    /// Same-entity calls run in queue order; different entities run
    /// concurrently up to `max_concurrency`. Mutation failures are reported in
    /// the results, never returned as `Err`.
    pub async fn commit(&self, force: bool) -> Result<CommitOutcome> {
        let started = Instant::now();

        let (transaction_id, operations, config) = {
            let mut state = self.state();
            if state.active.is_none() {
                if !force {
                    return Err(TransactionError::invalid_state("no active transaction to commit"));
                }
                state.active = Some(Transaction::new(self.default_config.clone()));
            }
            let Some(tx) = state.active.as_mut() else {
                return Err(TransactionError::invalid_state("no active transaction to commit"));
            };

            if tx.status == TransactionStatus::Executing {
                return Err(TransactionError::invalid_state("transaction is already executing"));
            }
            if tx.operations.is_empty() && !force {
                return Err(TransactionError::invalid_state("nothing to commit"));
            }
            if tx.config.require_confirmation && tx.status != TransactionStatus::Reviewing && !force {
                return Err(TransactionError::invalid_state("transaction must be reviewed before commit"));
            }

            tx.status = TransactionStatus::Executing;
            tx.started_at = Some(chrono::Utc::now());
            (tx.id, tx.operations.clone(), tx.config.clone())
        };

        tracing::info!(
            "Manager {}: committing transaction {} ({} operations)",
            self.name, transaction_id, operations.len()
        );
        self.emit(TransactionEvent::TransactionStart {
            transaction_id,
            operation_count: operations.len(),
        });

        let plans = plan_commit(&operations);
        let by_id: HashMap<OperationId, &Operation> = operations.iter().map(|op| (op.id, op)).collect();

        let mut collected: HashMap<OperationId, OperationResult> = HashMap::new();
        for plan in &plans {
            for (op_id, reason) in &plan.skipped {
                if let Some(op) = by_id.get(op_id) {
                    let outcome = match reason {
                        SkipReason::Coalesced { into } => OperationOutcome::Coalesced { into: *into },
                        SkipReason::CancelledOut => OperationOutcome::CancelledOut,
                    };
                    collected.insert(*op_id, OperationResult::skipped(op, outcome));
                }
            }
        }

        let executed: Vec<Vec<OperationResult>> = stream::iter(plans.into_iter().filter(|p| !p.calls.is_empty()))
            .map(|plan| self.execute_plan(transaction_id, plan, &config))
            .buffer_unordered(config.max_concurrency.max(1))
            .collect()
            .await;
        for result in executed.into_iter().flatten() {
            collected.insert(result.operation_id, result);
        }

        // Results in queue order
        let results: Vec<OperationResult> = operations
            .iter()
            .filter_map(|op| collected.remove(&op.id))
            .collect();

        let failed = results.iter().filter(|r| !r.success()).count();
        let status = if failed > 0 && !config.allow_partial_success {
            TransactionStatus::Failed
        } else {
            TransactionStatus::Completed
        };

        {
            let mut state = self.state();
            state.pending.clear();
            if let Some(mut tx) = state.active.take() {
                tx.status = status;
                tx.results = results.clone();
                tx.finished_at = Some(chrono::Utc::now());
                state.last = Some(tx);
            }
        }

        if failed > 0 {
            tracing::warn!(
                "Manager {}: transaction {} finished {:?} with {} failed operations",
                self.name, transaction_id, status, failed
            );
        } else {
            tracing::info!("Manager {}: transaction {} {:?}", self.name, transaction_id, status);
        }

        self.emit(TransactionEvent::TransactionComplete {
            transaction_id,
            status,
            results: results.clone(),
        });

        Ok(CommitOutcome {
            transaction_id,
            status,
            results,
            duration: started.elapsed(),
        })
    }

    /// Run one entity's calls strictly in order
    async fn execute_plan(
        &self,
        transaction_id: TransactionId,
        plan: EntityPlan,
        config: &TransactionConfig,
    ) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(plan.calls.len());
        for call in plan.calls {
            let (outcome, duration) = run_mutation(call.mutation.as_ref(), &call.request, config.timeout()).await;

            let result = match outcome {
                Ok(response) => {
                    tracing::debug!(
                        "Manager {}: {} {} applied in {:?}",
                        self.name, call.request.kind, plan.entity_id, duration
                    );
                    OperationResult {
                        operation_id: call.operation_id,
                        entity_id: plan.entity_id.clone(),
                        kind: call.request.kind,
                        outcome: OperationOutcome::Applied,
                        error: None,
                        duration,
                        response: Some(response),
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        "Manager {}: {} {} failed in {:?}: {}",
                        self.name, call.request.kind, plan.entity_id, duration, source
                    );
                    let error = TransactionError::mutation_failed(call.operation_id, source);
                    self.emit(TransactionEvent::TransactionError {
                        transaction_id,
                        operation_id: call.operation_id,
                        entity_id: plan.entity_id.clone(),
                        error: error.clone(),
                    });
                    OperationResult {
                        operation_id: call.operation_id,
                        entity_id: plan.entity_id.clone(),
                        kind: call.request.kind,
                        outcome: OperationOutcome::Failed,
                        error: Some(error),
                        duration,
                        response: None,
                    }
                }
            };

            self.emit(TransactionEvent::OperationComplete {
                transaction_id,
                result: result.clone(),
            });
            results.push(result);
        }
        results
    }

    /// Compensate the applied calls of the last, failed transaction, newest first
    pub async fn rollback(&self) -> Result<CommitOutcome> {
        let started = Instant::now();

        let (transaction_id, operations, applied, config) = {
            let mut state = self.state();
            if state.active.as_ref().is_some_and(|tx| tx.status == TransactionStatus::Executing) {
                return Err(TransactionError::invalid_state("cannot roll back while a transaction is executing"));
            }
            let Some(tx) = state.last.as_mut() else {
                return Err(TransactionError::invalid_state("no finished transaction to roll back"));
            };
            if tx.status != TransactionStatus::Failed {
                return Err(TransactionError::invalid_state(format!(
                    "only failed transactions can be rolled back (status is {:?})",
                    tx.status
                )));
            }
            tx.status = TransactionStatus::Executing;
            let applied: Vec<OperationResult> = tx
                .results
                .iter()
                .filter(|r| r.outcome == OperationOutcome::Applied)
                .cloned()
                .collect();
            (tx.id, tx.operations.clone(), applied, tx.config.clone())
        };

        tracing::info!(
            "Manager {}: rolling back {} applied operations of transaction {}",
            self.name, applied.len(), transaction_id
        );

        // Rebuild the exact requests commit sent
        let calls: HashMap<OperationId, (MutationRequest, Arc<dyn Mutation>)> = plan_commit(&operations)
            .into_iter()
            .flat_map(|plan| plan.calls)
            .map(|call| (call.operation_id, (call.request, call.mutation)))
            .collect();

        let mut results = Vec::with_capacity(applied.len());
        for done in applied.iter().rev() {
            let Some((request, mutation)) = calls.get(&done.operation_id) else {
                continue;
            };

            let (outcome, duration, kind) = match plan_compensation(request, done.response.as_ref()) {
                Ok(undo) => {
                    let (outcome, duration) = run_mutation(mutation.as_ref(), &undo, config.timeout()).await;
                    (outcome, duration, undo.kind)
                }
                Err(e) => (Err(e), Duration::ZERO, request.kind),
            };

            let result = match outcome {
                Ok(response) => OperationResult {
                    operation_id: done.operation_id,
                    entity_id: done.entity_id.clone(),
                    kind,
                    outcome: OperationOutcome::Applied,
                    error: None,
                    duration,
                    response: Some(response),
                },
                Err(source) => {
                    tracing::warn!(
                        "Manager {}: compensation for {} failed: {}",
                        self.name, done.entity_id, source
                    );
                    OperationResult {
                        operation_id: done.operation_id,
                        entity_id: done.entity_id.clone(),
                        kind,
                        outcome: OperationOutcome::Failed,
                        error: Some(TransactionError::mutation_failed(done.operation_id, source)),
                        duration,
                        response: None,
                    }
                }
            };
            results.push(result);
        }

        {
            let mut state = self.state();
            if let Some(tx) = state.last.as_mut().filter(|tx| tx.id == transaction_id) {
                tx.status = TransactionStatus::RolledBack;
                tx.finished_at = Some(chrono::Utc::now());
            }
        }

        tracing::info!("Manager {}: transaction {} rolled back", self.name, transaction_id);
        self.emit(TransactionEvent::RollbackComplete {
            transaction_id,
            results: results.clone(),
        });

        Ok(CommitOutcome {
            transaction_id,
            status: TransactionStatus::RolledBack,
            results,
            duration: started.elapsed(),
        })
    }

    /// Discard every queued operation without touching the remote
    pub fn cancel(&self) -> Result<()> {
        let (transaction_id, discarded) = {
            let mut state = self.state();
            match &state.active {
                None => return Err(TransactionError::invalid_state("no active transaction to cancel")),
                Some(tx) if tx.status == TransactionStatus::Executing => {
                    return Err(TransactionError::invalid_state(
                        "cannot cancel a transaction while it is executing",
                    ));
                }
                Some(_) => {}
            }

            state.pending.clear();
            let Some(mut tx) = state.active.take() else {
                return Err(TransactionError::invalid_state("no active transaction to cancel"));
            };
            tx.status = TransactionStatus::Cancelled;
            tx.finished_at = Some(chrono::Utc::now());
            let out = (tx.id, tx.operations.clone());
            state.last = Some(tx);
            out
        };

        tracing::info!(
            "Manager {}: cancelled transaction {} ({} operations discarded)",
            self.name, transaction_id, discarded.len()
        );
        self.emit(TransactionEvent::TransactionCancelled { transaction_id, discarded });
        Ok(())
    }

    // ========================================
    // Queries
    // ========================================

    pub fn get_summary(&self) -> TransactionSummary {
        self.state()
            .active
            .as_ref()
            .map(Transaction::summary)
            .unwrap_or_default()
    }

    pub fn has_operations(&self) -> bool {
        self.operation_count() > 0
    }

    pub fn operation_count(&self) -> usize {
        self.state().active.as_ref().map(|tx| tx.operations.len()).unwrap_or(0)
    }

    /// Whether a commit button should be enabled
    pub fn can_commit(&self) -> bool {
        self.state()
            .active
            .as_ref()
            .is_some_and(|tx| tx.status.is_open() && !tx.operations.is_empty())
    }

    /// Status of the active transaction, else of the last finished one
    pub fn status(&self) -> Option<TransactionStatus> {
        let state = self.state();
        state.active.as_ref().or(state.last.as_ref()).map(|tx| tx.status)
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.state().active.as_ref().map(|tx| tx.id)
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state()
            .active
            .as_ref()
            .map(|tx| tx.operations.clone())
            .unwrap_or_default()
    }

    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        self.state().active.as_ref()?.operation(id).cloned()
    }

    pub fn active_transaction(&self) -> Option<Transaction> {
        self.state().active.clone()
    }

    pub fn last_transaction(&self) -> Option<Transaction> {
        self.state().last.clone()
    }

    pub fn pending_state(&self, entity_id: &EntityId) -> Option<PendingState> {
        self.state().pending.get(entity_id).cloned()
    }

    pub fn pending_states(&self) -> HashMap<EntityId, PendingState> {
        self.state().pending.clone()
    }

    /// Accumulated data for an entity with pending changes
    pub fn get_pending_data(&self, entity_id: &EntityId) -> Option<Map<String, Value>> {
        self.state().pending.get(entity_id).map(|p| p.data.clone())
    }

    // ========================================
    // Subscriptions
    // ========================================

    /// Listen for one kind of event
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&TransactionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(move |event: &TransactionEvent| {
            if event.kind() == kind {
                listener(event);
            }
        })
    }

    /// Listen for every event
    pub fn on_any(&self, listener: impl Fn(&TransactionEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.events.len()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("name", &self.name)
            .field("operations", &self.operation_count())
            .field("status", &self.status())
            .finish()
    }
}

/// Invoke one mutation with timeout protection
async fn run_mutation(
    mutation: &dyn Mutation,
    request: &MutationRequest,
    limit: Duration,
) -> (std::result::Result<Value, MutationError>, Duration) {
    let started = Instant::now();
    // zero disables the timeout
    let outcome = if limit.is_zero() {
        mutation.execute(request).await
    } else {
        match timeout(limit, mutation.execute(request)).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(MutationError::Timeout(limit)),
        }
    };
    (outcome, started.elapsed())
}
