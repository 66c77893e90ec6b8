use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::TransactionConfig;
use crate::error::TransactionError;
use crate::transaction::operation::Operation;
use crate::types::{EntityId, OperationId, OperationKind, TransactionId, Trigger};

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Reviewing,
    Executing,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl TransactionStatus {
    /// Completed, rolled back and cancelled transactions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Cancelled)
    }

    /// Still accepting operations
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Reviewing)
    }
}

/// What happened to one queued operation during commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OperationOutcome {
    /// Its mutation ran and succeeded
    Applied,
    /// Its mutation ran and failed
    Failed,
    /// Folded into a later operation on the same entity that carried the net change
    Coalesced { into: OperationId },
    /// Created and deleted within the same transaction; nothing was sent
    CancelledOut,
}

/// Per-operation commit result
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub entity_id: EntityId,
    /// Kind of the remote call made; for skipped operations, the queued kind
    pub kind: OperationKind,
    pub outcome: OperationOutcome,
    pub error: Option<TransactionError>,
    pub duration: Duration,
    /// Remote response for applied operations
    pub response: Option<Value>,
}

impl OperationResult {
    pub fn success(&self) -> bool {
        self.outcome != OperationOutcome::Failed
    }

    /// Whether a mutation was actually invoked for this operation
    pub fn executed(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Applied | OperationOutcome::Failed)
    }

    pub fn skipped(operation: &Operation, outcome: OperationOutcome) -> Self {
        Self {
            operation_id: operation.id,
            entity_id: operation.entity_id.clone(),
            kind: operation.kind,
            outcome,
            error: None,
            duration: Duration::ZERO,
            response: None,
        }
    }
}

/// Returned by commit and rollback
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub results: Vec<OperationResult>,
    pub duration: Duration,
}

impl CommitOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| !r.success())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Entities whose remote call failed, for surfacing in the UI
    pub fn failed_entities(&self) -> Vec<EntityId> {
        self.failures().map(|r| r.entity_id.clone()).collect()
    }

    pub fn applied_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome == OperationOutcome::Applied).count()
    }

    pub fn result_for(&self, operation_id: OperationId) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.operation_id == operation_id)
    }
}

/// Counts over the queued operations of one or more managers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub total: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub user_edits: usize,
    pub bulk_actions: usize,
    pub row_actions: usize,
    pub entity_types: BTreeSet<String>,
}

impl TransactionSummary {
    pub fn from_operations<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut summary = Self::default();
        for op in operations {
            summary.total += 1;
            match op.kind {
                OperationKind::Create => summary.creates += 1,
                OperationKind::Update => summary.updates += 1,
                OperationKind::Delete => summary.deletes += 1,
            }
            match op.trigger {
                Trigger::UserEdit => summary.user_edits += 1,
                Trigger::BulkAction => summary.bulk_actions += 1,
                Trigger::RowAction => summary.row_actions += 1,
            }
            summary.entity_types.insert(op.entity_type.clone());
        }
        summary
    }

    pub fn entity_type_count(&self) -> usize {
        self.entity_types.len()
    }

    /// Fold another summary into this one
    pub fn absorb(&mut self, other: &TransactionSummary) {
        self.total += other.total;
        self.creates += other.creates;
        self.updates += other.updates;
        self.deletes += other.deletes;
        self.user_edits += other.user_edits;
        self.bulk_actions += other.bulk_actions;
        self.row_actions += other.row_actions;
        self.entity_types.extend(other.entity_types.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// One batch of operations and its lifecycle
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub operations: Vec<Operation>,
    pub results: Vec<OperationResult>,
    pub config: TransactionConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            id: TransactionId::new(),
            status: TransactionStatus::Pending,
            operations: Vec::new(),
            results: Vec::new(),
            config,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary::from_operations(&self.operations)
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }
}
