use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::entity::{EntityRecord, ID_FIELD};
use crate::transaction::mutation::{Mutation, MutationRequest};
use crate::types::{EntityId, OperationId, OperationKind, Trigger};

/// One queued create/update/delete request together with the command that performs it
#[derive(Clone)]
pub struct Operation {
    /// Assigned when the operation is enqueued
    pub id: OperationId,
    pub kind: OperationKind,
    pub trigger: Trigger,
    /// Collection/endpoint the entity belongs to
    pub entity_type: String,
    /// The entity as it should look after this operation (possibly partial)
    pub entity: Map<String, Value>,
    pub entity_id: EntityId,
    /// The entity before this operation
    pub original_data: Option<Map<String, Value>>,
    /// Fields an update touches; empty for create and delete
    pub changed_fields: Vec<String>,
    pub mutation: Arc<dyn Mutation>,
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: EntityId,
        entity: Map<String, Value>,
        mutation: Arc<dyn Mutation>,
    ) -> Self {
        let entity_type = entity_type.into();
        let label = default_label(kind, &entity_type, &entity_id);
        Self {
            id: OperationId::new(),
            kind,
            trigger: Trigger::default(),
            entity_type,
            entity,
            entity_id,
            original_data: None,
            changed_fields: Vec::new(),
            mutation,
            label,
            timestamp: Utc::now(),
        }
    }

    /// Create with the id taken from the entity, or a fresh temporary id
    pub fn create(entity_type: impl Into<String>, mut entity: Map<String, Value>, mutation: Arc<dyn Mutation>) -> Self {
        let entity_id = match entity.get(ID_FIELD).and_then(EntityId::from_value) {
            Some(id) => id,
            None => {
                let id = EntityId::temporary();
                entity.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                id
            }
        };
        Self::new(OperationKind::Create, entity_type, entity_id, entity, mutation)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<EntityId>,
        entity: Map<String, Value>,
        mutation: Arc<dyn Mutation>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Update, entity_type, entity_id.into(), entity, mutation);
        op.changed_fields = op.entity.keys().filter(|k| k.as_str() != ID_FIELD).cloned().collect();
        op
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<EntityId>, mutation: Arc<dyn Mutation>) -> Self {
        let entity_id = entity_id.into();
        let mut entity = Map::new();
        entity.insert(ID_FIELD.to_string(), Value::String(entity_id.to_string()));
        Self::new(OperationKind::Delete, entity_type, entity_id, entity, mutation)
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Attach the pre-edit snapshot; for updates the changed fields are re-derived from the diff
    pub fn with_original(mut self, original: Map<String, Value>) -> Self {
        if self.kind == OperationKind::Update {
            let record = EntityRecord::edited(original.clone(), &self.entity);
            self.changed_fields = record.diff().changed_fields();
        }
        self.original_data = Some(original);
        self
    }

    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        if self.kind == OperationKind::Update {
            self.changed_fields = fields;
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Request for this operation alone, without accumulated pending data
    pub fn request(&self) -> MutationRequest {
        MutationRequest {
            kind: self.kind,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            data: self.entity.clone(),
            original_data: self.original_data.clone(),
        }
    }
}

fn default_label(kind: OperationKind, entity_type: &str, entity_id: &EntityId) -> String {
    let verb = match kind {
        OperationKind::Create => "Create",
        OperationKind::Update => "Update",
        OperationKind::Delete => "Delete",
    };
    if entity_id.is_temporary() {
        format!("{} new {}", verb, entity_type)
    } else {
        format!("{} {} #{}", verb, entity_type, entity_id)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trigger", &self.trigger)
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .field("changed_fields", &self.changed_fields)
            .field("mutation", &self.mutation.name())
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
