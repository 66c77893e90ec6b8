use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::entity::{merge_into, ID_FIELD};
use crate::error::MutationError;
use crate::types::{EntityId, OperationKind};

/// The net remote effect handed to a mutation command at commit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_id: EntityId,
    /// Accumulated data for the entity, not just the latest edit
    pub data: Map<String, Value>,
    pub original_data: Option<Map<String, Value>>,
}

/// Command that performs the real remote effect of an operation.
///
/// The engine only looks at whether `execute` succeeded. Implementations
/// dispatch on `request.kind`; retries and backoff are their business.
#[async_trait]
pub trait Mutation: Send + Sync {
    async fn execute(&self, request: &MutationRequest) -> Result<Value, MutationError>;

    /// Name for logging and debugging
    fn name(&self) -> &str {
        "mutation"
    }
}

/// Adapter turning an async closure into a mutation command
pub struct FnMutation<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> Mutation for FnMutation<F>
where
    F: Fn(MutationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, MutationError>> + Send,
{
    async fn execute(&self, request: &MutationRequest) -> Result<Value, MutationError> {
        (self.func)(request.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a shareable mutation command
pub fn mutation_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn Mutation>
where
    F: Fn(MutationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, MutationError>> + Send + 'static,
{
    Arc::new(FnMutation { name: name.into(), func })
}

// ========================================
// In-memory remote
// ========================================

#[derive(Debug, Default)]
struct RemoteState {
    collections: HashMap<String, BTreeMap<EntityId, Map<String, Value>>>,
    calls: Vec<MutationRequest>,
    fail_next: HashMap<EntityId, String>,
    next_id: u64,
}

/// In-process entity store standing in for a remote API.
///
/// Creates with temporary ids get a sequential real id. Failures can be
/// injected per entity for the next call that touches it.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Option<Duration>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to exercise concurrent commits
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed existing rows; ids must be present
    pub fn seed(&self, entity_type: &str, rows: impl IntoIterator<Item = Map<String, Value>>) {
        let mut state = self.state();
        for row in rows {
            let Some(id) = row.get(ID_FIELD).and_then(EntityId::from_value) else {
                tracing::warn!("Skipping seed row without id for {}", entity_type);
                continue;
            };
            if let Ok(numeric) = id.as_str().parse::<u64>() {
                state.next_id = state.next_id.max(numeric);
            }
            state.collections.entry(entity_type.to_string()).or_default().insert(id, row);
        }
    }

    /// Make the next call touching `entity_id` fail with `message`
    pub fn fail_next(&self, entity_id: impl Into<EntityId>, message: impl Into<String>) {
        self.state().fail_next.insert(entity_id.into(), message.into());
    }

    pub fn get(&self, entity_type: &str, entity_id: &EntityId) -> Option<Map<String, Value>> {
        self.state().collections.get(entity_type)?.get(entity_id).cloned()
    }

    /// All rows of a collection ordered by id
    pub fn rows(&self, entity_type: &str) -> Vec<Map<String, Value>> {
        self.state()
            .collections
            .get(entity_type)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every request received so far, in arrival order
    pub fn calls(&self) -> Vec<MutationRequest> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, entity_id: &EntityId) -> Vec<MutationRequest> {
        self.state()
            .calls
            .iter()
            .filter(|call| &call.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn apply(&self, request: &MutationRequest) -> Result<Value, MutationError> {
        let mut state = self.state();
        state.calls.push(request.clone());

        if let Some(message) = state.fail_next.remove(&request.entity_id) {
            return Err(MutationError::Rejected(message));
        }

        match request.kind {
            OperationKind::Create => {
                let id = if request.entity_id.is_temporary() {
                    state.next_id += 1;
                    EntityId::new(state.next_id.to_string())
                } else {
                    request.entity_id.clone()
                };
                let mut row = request.data.clone();
                row.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                state
                    .collections
                    .entry(request.entity_type.clone())
                    .or_default()
                    .insert(id, row.clone());
                Ok(Value::Object(row))
            }
            OperationKind::Update => {
                let row = state
                    .collections
                    .get_mut(&request.entity_type)
                    .and_then(|rows| rows.get_mut(&request.entity_id))
                    .ok_or_else(|| MutationError::NotFound(request.entity_id.to_string()))?;
                merge_into(row, &request.data);
                Ok(Value::Object(row.clone()))
            }
            OperationKind::Delete => {
                let removed = state
                    .collections
                    .get_mut(&request.entity_type)
                    .and_then(|rows| rows.remove(&request.entity_id))
                    .ok_or_else(|| MutationError::NotFound(request.entity_id.to_string()))?;
                Ok(Value::Object(removed))
            }
        }
    }
}

#[async_trait]
impl Mutation for InMemoryRemote {
    async fn execute(&self, request: &MutationRequest) -> Result<Value, MutationError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.apply(request)
    }

    fn name(&self) -> &str {
        "in_memory_remote"
    }
}
