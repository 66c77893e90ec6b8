use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::RwLock;

use crate::entity::ID_FIELD;
use crate::error::CacheError;
use crate::types::EntityId;

/// One cached page of query results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub rows: Vec<Map<String, Value>>,
    /// Server-side row count across all pages
    pub total: u64,
}

impl CacheEntry {
    pub fn new(rows: Vec<Map<String, Value>>) -> Self {
        let total = rows.len() as u64;
        Self { rows, total }
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get(ID_FIELD).and_then(EntityId::from_value).as_ref() == Some(id))
    }

    pub fn find(&self, id: &EntityId) -> Option<&Map<String, Value>> {
        self.position(id).map(|i| &self.rows[i])
    }
}

/// Identity of a cached query. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub endpoint: String,
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            page: 1,
            page_size: 25,
            filters: BTreeMap::new(),
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn prefix(&self) -> KeyPrefix {
        KeyPrefix::new(self.endpoint.clone())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?page={}&size={}", self.endpoint, self.page, self.page_size)?;
        for (field, value) in &self.filters {
            write!(f, "&{}={}", field, value)?;
        }
        Ok(())
    }
}

/// Matches every key of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    pub endpoint: String,
}

impl KeyPrefix {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        key.endpoint == self.endpoint
    }
}

pub type CacheUpdater = Box<dyn FnOnce(Option<CacheEntry>) -> Option<CacheEntry> + Send>;

/// Keyed store of query results the view renders from.
///
/// `write` hands the current entry to `updater`; returning `None` removes the key.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn read(&self, key: &QueryKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn write(&self, key: &QueryKey, updater: CacheUpdater) -> Result<(), CacheError>;

    /// Drop every entry under `prefix`; returns how many were dropped
    async fn invalidate(&self, prefix: &KeyPrefix) -> Result<usize, CacheError>;
}

#[derive(Debug, Default)]
pub struct InMemoryQueryCache {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: QueryKey, entry: CacheEntry) {
        self.entries.write().await.insert(key, entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn read(&self, key: &QueryKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &QueryKey, updater: CacheUpdater) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        match updater(entries.remove(key)) {
            Some(entry) => {
                entries.insert(key.clone(), entry);
            }
            None => {
                tracing::trace!("Cache entry {} removed", key);
            }
        }
        Ok(())
    }

    async fn invalidate(&self, prefix: &KeyPrefix) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !prefix.matches(key));
        let dropped = before - entries.len();
        tracing::debug!("Invalidated {} cache entries under {}", dropped, prefix.endpoint);
        Ok(dropped)
    }
}
