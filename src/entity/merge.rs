//! Field-level merge for accumulating partial entity snapshots.
//!
//! Semantics are last-write-wins per top-level field:
//! - a field present in `patch` overwrites the same field in `base`
//! - a field absent from `patch` is retained from `base`
//! - existing fields keep their position; new fields are appended in patch order
//!
//! Nested objects are replaced whole, not merged recursively.

use serde_json::{Map, Value};

/// Merge `patch` into a copy of `base`
pub fn merge_fields(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    merge_into(&mut merged, patch);
    merged
}

/// Merge `patch` into `base` in place
pub fn merge_into(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        // Map::insert keeps the slot of an existing key under preserve_order
        base.insert(key.clone(), value.clone());
    }
}
