use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::entity::merge::merge_into;
use crate::types::EntityId;

/// Field holding the primary key in entity snapshots
pub const ID_FIELD: &str = "id";

/// Before and after value of a field that exists on both sides
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub before: Value,
    pub after: Value,
}

/// Field-level comparison of an edited snapshot against its source
#[derive(Debug, Clone, Default)]
pub struct EntityDiff {
    pub added: BTreeMap<String, Value>,
    pub modified: BTreeMap<String, FieldChange>,
    pub removed: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Names of every field that differs, sorted
    pub fn changed_fields(&self) -> Vec<String> {
        let mut fields: BTreeSet<&String> = self.added.keys().collect();
        fields.extend(self.modified.keys());
        fields.extend(self.removed.iter());
        fields.into_iter().cloned().collect()
    }
}

/// A snapshot with a partial edit applied, remembering what it looked like before
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRecord {
    source: Option<Map<String, Value>>,
    current: Map<String, Value>,
}

impl EntityRecord {
    /// Snapshot with no remote counterpart
    pub fn new(current: Map<String, Value>) -> Self {
        Self { source: None, current }
    }

    pub fn edited(source: Map<String, Value>, patch: &Map<String, Value>) -> Self {
        let mut current = source.clone();
        merge_into(&mut current, patch);
        Self { source: Some(source), current }
    }

    pub fn id(&self) -> Option<EntityId> {
        self.current
            .get(ID_FIELD)
            .or_else(|| self.source.as_ref().and_then(|s| s.get(ID_FIELD)))
            .and_then(EntityId::from_value)
    }

    pub fn changed(&self, field: &str) -> bool {
        match &self.source {
            Some(source) => source.get(field) != self.current.get(field),
            None => self.current.contains_key(field),
        }
    }

    pub fn diff(&self) -> EntityDiff {
        let mut diff = EntityDiff::default();
        let empty = Map::new();
        let source = self.source.as_ref().unwrap_or(&empty);

        for (field, after) in &self.current {
            match source.get(field) {
                None => {
                    diff.added.insert(field.clone(), after.clone());
                }
                Some(before) if before != after => {
                    let change = FieldChange { before: before.clone(), after: after.clone() };
                    diff.modified.insert(field.clone(), change);
                }
                Some(_) => {
                    diff.unchanged.insert(field.clone());
                }
            }
        }
        diff.removed = source
            .keys()
            .filter(|field| !self.current.contains_key(*field))
            .cloned()
            .collect();
        diff
    }

    /// Patch that puts every touched field back, keeping the id; added fields become null.
    /// None when there is no source to go back to.
    pub fn inverse_patch(&self) -> Option<Map<String, Value>> {
        let source = self.source.as_ref()?;
        let mut patch = Map::new();
        if let Some(id) = source.get(ID_FIELD) {
            patch.insert(ID_FIELD.to_string(), id.clone());
        }
        for field in self.current.keys().filter(|f| self.changed(f)) {
            let before = source.get(field).cloned().unwrap_or(Value::Null);
            patch.insert(field.clone(), before);
        }
        Some(patch)
    }
}
