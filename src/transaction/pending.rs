//! Pending-state resolution and commit planning.
//!
//! Every entity with queued operations has exactly one [`PendingState`]: the
//! net effect of all of them. [`resolve`] folds one new operation into the
//! prior state; [`plan_commit`] replays a queue and turns each entity's net
//! state into at most one remote call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::{merge_fields, EntityRecord, ID_FIELD};
use crate::error::{MutationError, TransactionError};
use crate::transaction::mutation::{Mutation, MutationRequest};
use crate::transaction::operation::Operation;
use crate::types::{EntityId, OperationId, OperationKind};

/// Visual status of an entity with uncommitted changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Added,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingState {
    pub state: PendingKind,
    /// The operation a `remove_operation` must name to undo this state
    pub operation_id: OperationId,
    /// Net entity data across every queued operation
    pub data: Map<String, Value>,
}

impl PendingState {
    fn new(state: PendingKind, operation_id: OperationId, data: Map<String, Value>) -> Self {
        Self { state, operation_id, data }
    }
}

/// Outcome of folding one operation into an entity's pending state
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Queue the operation; this becomes the entity's pending state
    Apply(PendingState),
    /// Redundant operation; queue nothing and keep the prior state
    Ignore,
}

/// Fold `op` into the entity's prior pending state.
///
/// `created_in_transaction` tells whether the entity only exists because of
/// this transaction (temporary id or a queued create); it decides whether a
/// deleted entity that gets edited again comes back as added or edited.
pub fn resolve(
    prior: Option<&PendingState>,
    op: &Operation,
    created_in_transaction: bool,
) -> Result<Resolution, TransactionError> {
    use OperationKind::*;
    use PendingKind::*;

    let state = match (prior.map(|p| (p.state, &p.data)), op.kind) {
        (None, Create) => PendingState::new(Added, op.id, op.entity.clone()),
        (None, Update) => PendingState::new(Edited, op.id, op.entity.clone()),
        (None, Delete) => {
            let data = op.original_data.clone().unwrap_or_else(|| op.entity.clone());
            PendingState::new(Deleted, op.id, data)
        }

        // A second create for a just-created entity is just more data for it
        (Some((Added, data)), Update | Create) => PendingState::new(Added, op.id, merge_fields(data, &op.entity)),
        (Some((Added, data)), Delete) => PendingState::new(Deleted, op.id, data.clone()),

        (Some((Edited, data)), Update) => PendingState::new(Edited, op.id, merge_fields(data, &op.entity)),
        (Some((Edited, _)), Create) => {
            return Err(TransactionError::invalid_state(format!(
                "cannot create {} {}: it already exists and has pending edits",
                op.entity_type, op.entity_id
            )));
        }
        (Some((Edited, data)), Delete) => PendingState::new(Deleted, op.id, data.clone()),

        // Reinstating a just-created entity keeps what the create carried
        (Some((Deleted, data)), Update | Create) if created_in_transaction || op.entity_id.is_temporary() => {
            PendingState::new(Added, op.id, merge_fields(data, &op.entity))
        }
        (Some((Deleted, _)), Update | Create) => PendingState::new(Edited, op.id, op.entity.clone()),
        (Some((Deleted, _)), Delete) => return Ok(Resolution::Ignore),
    };

    Ok(Resolution::Apply(state))
}

/// Net pending state of one entity's operations, in queue order
pub fn replay<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Option<PendingState> {
    let mut state: Option<PendingState> = None;
    let mut created = false;

    for op in operations {
        created |= op.kind == OperationKind::Create || op.entity_id.is_temporary();
        match resolve(state.as_ref(), op, created) {
            Ok(Resolution::Apply(next)) => state = Some(next),
            Ok(Resolution::Ignore) => {}
            Err(e) => {
                tracing::warn!("Skipping operation {} during replay: {}", op.id, e);
            }
        }
    }

    state
}

// ========================================
// Commit planning
// ========================================

/// Why an operation made no remote call of its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Coalesced { into: OperationId },
    CancelledOut,
}

/// A remote call to make on behalf of one operation
#[derive(Clone)]
pub struct PlannedCall {
    pub operation_id: OperationId,
    pub request: MutationRequest,
    pub mutation: Arc<dyn Mutation>,
}

impl std::fmt::Debug for PlannedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedCall")
            .field("operation_id", &self.operation_id)
            .field("request", &self.request)
            .field("mutation", &self.mutation.name())
            .finish()
    }
}

/// Everything commit does for one entity. Calls run strictly in order.
#[derive(Debug, Clone)]
pub struct EntityPlan {
    pub entity_id: EntityId,
    pub calls: Vec<PlannedCall>,
    pub skipped: Vec<(OperationId, SkipReason)>,
}

/// Group a queue by entity (first-appearance order) and plan one net call per entity
pub fn plan_commit(operations: &[Operation]) -> Vec<EntityPlan> {
    group_by_entity(operations)
        .into_iter()
        .map(|(entity_id, ops)| plan_entity(entity_id, &ops))
        .collect()
}

fn group_by_entity(operations: &[Operation]) -> Vec<(EntityId, Vec<&Operation>)> {
    let mut index: HashMap<&EntityId, usize> = HashMap::new();
    let mut groups: Vec<(EntityId, Vec<&Operation>)> = Vec::new();

    for op in operations {
        match index.get(&op.entity_id) {
            Some(&i) => groups[i].1.push(op),
            None => {
                index.insert(&op.entity_id, groups.len());
                groups.push((op.entity_id.clone(), vec![op]));
            }
        }
    }

    groups
}

fn plan_entity(entity_id: EntityId, ops: &[&Operation]) -> EntityPlan {
    let created = ops.iter().any(|op| op.kind == OperationKind::Create) || entity_id.is_temporary();
    let Some(state) = replay(ops.iter().copied()) else {
        return cancelled_out(entity_id, ops);
    };

    let kind = match state.state {
        PendingKind::Added => OperationKind::Create,
        PendingKind::Edited => OperationKind::Update,
        PendingKind::Deleted if created => return cancelled_out(entity_id, ops),
        PendingKind::Deleted => OperationKind::Delete,
    };

    let Some(authority) = ops.iter().find(|op| op.id == state.operation_id) else {
        return cancelled_out(entity_id, ops);
    };

    // Pre-transaction snapshot: the first operation that knew it
    let original_data = ops.iter().find_map(|op| op.original_data.clone());

    let call = PlannedCall {
        operation_id: authority.id,
        request: MutationRequest {
            kind,
            entity_type: authority.entity_type.clone(),
            entity_id: entity_id.clone(),
            data: state.data,
            original_data: if kind == OperationKind::Create { None } else { original_data },
        },
        mutation: authority.mutation.clone(),
    };

    let skipped = ops
        .iter()
        .filter(|op| op.id != authority.id)
        .map(|op| (op.id, SkipReason::Coalesced { into: authority.id }))
        .collect();

    EntityPlan { entity_id, calls: vec![call], skipped }
}

fn cancelled_out(entity_id: EntityId, ops: &[&Operation]) -> EntityPlan {
    EntityPlan {
        entity_id,
        calls: Vec::new(),
        skipped: ops.iter().map(|op| (op.id, SkipReason::CancelledOut)).collect(),
    }
}

// ========================================
// Compensation
// ========================================

/// Request that undoes an applied call, given the remote's response to it
pub fn plan_compensation(applied: &MutationRequest, response: Option<&Value>) -> Result<MutationRequest, MutationError> {
    let (kind, entity_id, data) = match applied.kind {
        OperationKind::Create => {
            // The remote may have replaced a temporary id
            let entity_id = response
                .and_then(|r| r.get(ID_FIELD))
                .and_then(EntityId::from_value)
                .unwrap_or_else(|| applied.entity_id.clone());
            let mut data = Map::new();
            data.insert(ID_FIELD.to_string(), Value::String(entity_id.to_string()));
            (OperationKind::Delete, entity_id, data)
        }
        OperationKind::Update => {
            let original = applied.original_data.clone().ok_or_else(|| {
                MutationError::Rejected(format!("no original data to restore {}", applied.entity_id))
            })?;
            let inverse = EntityRecord::edited(original, &applied.data)
                .inverse_patch()
                .unwrap_or_default();
            (OperationKind::Update, applied.entity_id.clone(), inverse)
        }
        OperationKind::Delete => {
            let data = applied.original_data.clone().unwrap_or_else(|| applied.data.clone());
            (OperationKind::Create, applied.entity_id.clone(), data)
        }
    };

    Ok(MutationRequest {
        kind,
        entity_type: applied.entity_type.clone(),
        entity_id,
        data,
        original_data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mutation::InMemoryRemote;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn remote() -> Arc<dyn Mutation> {
        Arc::new(InMemoryRemote::new())
    }

    fn apply(prior: Option<&PendingState>, op: &Operation) -> PendingState {
        match resolve(prior, op, op.kind == OperationKind::Create).unwrap() {
            Resolution::Apply(state) => state,
            Resolution::Ignore => panic!("expected state change"),
        }
    }

    #[test]
    fn test_first_operation_sets_state() {
        let create = Operation::create("events", map(json!({"title": "a"})), remote());
        assert_eq!(apply(None, &create).state, PendingKind::Added);

        let update = Operation::update("events", "1", map(json!({"title": "b"})), remote());
        let state = apply(None, &update);
        assert_eq!(state.state, PendingKind::Edited);
        assert_eq!(state.operation_id, update.id);

        let delete = Operation::delete("events", "1", remote()).with_original(map(json!({"id": "1", "title": "x"})));
        let state = apply(None, &delete);
        assert_eq!(state.state, PendingKind::Deleted);
        assert_eq!(state.data["title"], json!("x"));
    }

    #[test]
    fn test_added_then_update_merges() {
        let create = Operation::create("events", map(json!({"title": "a", "room": "A"})), remote());
        let added = apply(None, &create);
        let update = Operation::update("events", create.entity_id.clone(), map(json!({"room": "B"})), remote());

        let state = apply(Some(&added), &update);
        assert_eq!(state.state, PendingKind::Added);
        assert_eq!(state.operation_id, update.id);
        assert_eq!(state.data["title"], json!("a"));
        assert_eq!(state.data["room"], json!("B"));
    }

    #[test]
    fn test_edited_then_delete_keeps_data() {
        let update = Operation::update("events", "1", map(json!({"title": "b"})), remote());
        let edited = apply(None, &update);
        let delete = Operation::delete("events", "1", remote());

        let state = apply(Some(&edited), &delete);
        assert_eq!(state.state, PendingKind::Deleted);
        assert_eq!(state.data["title"], json!("b"));
        assert_eq!(state.operation_id, delete.id);
    }

    #[test]
    fn test_double_delete_is_ignored() {
        let first = Operation::delete("events", "1", remote());
        let deleted = apply(None, &first);
        let second = Operation::delete("events", "1", remote());
        assert_eq!(resolve(Some(&deleted), &second, false).unwrap(), Resolution::Ignore);
    }

    #[test]
    fn test_resurrection_depends_on_origin() {
        let delete = Operation::delete("events", "1", remote());
        let deleted = apply(None, &delete);
        let update = Operation::update("events", "1", map(json!({"c": 3})), remote());

        let Resolution::Apply(state) = resolve(Some(&deleted), &update, false).unwrap() else { panic!() };
        assert_eq!(state.state, PendingKind::Edited);

        assert_eq!(state.data, map(json!({"c": 3})));

        let create = Operation::create("events", map(json!({"id": "1", "title": "New", "room": "A"})), remote());
        let added = apply(None, &create);
        let deleted = apply(Some(&added), &Operation::delete("events", "1", remote()));
        let Resolution::Apply(state) = resolve(Some(&deleted), &update, true).unwrap() else { panic!() };
        assert_eq!(state.state, PendingKind::Added);
        assert_eq!(state.data, map(json!({"id": "1", "title": "New", "room": "A", "c": 3})));
    }

    #[test]
    fn test_create_over_edited_is_rejected() {
        let update = Operation::update("events", "1", map(json!({"title": "b"})), remote());
        let edited = apply(None, &update);
        let create = Operation::create("events", map(json!({"id": "1", "title": "c"})), remote());
        let err = resolve(Some(&edited), &create, true).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
    }

    #[test]
    fn test_plan_create_then_delete_cancels_out() {
        let create = Operation::create("events", map(json!({"title": "a"})), remote());
        let delete = Operation::delete("events", create.entity_id.clone(), remote());
        let plans = plan_commit(&[create.clone(), delete.clone()]);

        assert_eq!(plans.len(), 1);
        assert!(plans[0].calls.is_empty());
        assert_eq!(
            plans[0].skipped,
            vec![(create.id, SkipReason::CancelledOut), (delete.id, SkipReason::CancelledOut)]
        );
    }

    #[test]
    fn test_plan_coalesces_updates_into_one_call() {
        let first = Operation::update("events", "E", map(json!({"x": 1})), remote());
        let second = Operation::update("events", "E", map(json!({"x": 2})), remote());
        let other = Operation::delete("events", "F", remote());
        let plans = plan_commit(&[first.clone(), other.clone(), second.clone()]);

        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].entity_id, EntityId::new("E"));
        assert_eq!(plans[0].calls.len(), 1);
        assert_eq!(plans[0].calls[0].operation_id, second.id);
        assert_eq!(plans[0].calls[0].request.data, map(json!({"x": 2})));
        assert_eq!(plans[0].skipped, vec![(first.id, SkipReason::Coalesced { into: second.id })]);
        assert_eq!(plans[1].calls[0].request.kind, OperationKind::Delete);
    }

    #[test]
    fn test_plan_create_then_update_is_single_create() {
        let create = Operation::create("events", map(json!({"title": "a"})), remote());
        let update = Operation::update("events", create.entity_id.clone(), map(json!({"room": "B"})), remote());
        let plans = plan_commit(&[create, update]);

        let request = &plans[0].calls[0].request;
        assert_eq!(request.kind, OperationKind::Create);
        assert_eq!(request.data["title"], json!("a"));
        assert_eq!(request.data["room"], json!("B"));
        assert!(request.original_data.is_none());
    }

    #[test]
    fn test_compensation_requests() {
        let update = MutationRequest {
            kind: OperationKind::Update,
            entity_type: "events".to_string(),
            entity_id: EntityId::new("1"),
            data: map(json!({"title": "new"})),
            original_data: Some(map(json!({"id": "1", "title": "old", "room": "A"}))),
        };
        let undo = plan_compensation(&update, None).unwrap();
        assert_eq!(undo.kind, OperationKind::Update);
        assert_eq!(undo.data, map(json!({"id": "1", "title": "old"})));

        let create = MutationRequest {
            kind: OperationKind::Create,
            entity_type: "events".to_string(),
            entity_id: EntityId::temporary(),
            data: map(json!({"title": "a"})),
            original_data: None,
        };
        let undo = plan_compensation(&create, Some(&json!({"id": "12", "title": "a"}))).unwrap();
        assert_eq!(undo.kind, OperationKind::Delete);
        assert_eq!(undo.entity_id, EntityId::new("12"));

        let no_original = MutationRequest { original_data: None, ..update };
        assert!(plan_compensation(&no_original, None).is_err());
    }
}
