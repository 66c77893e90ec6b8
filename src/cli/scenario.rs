// Scripted sessions against an in-memory remote, for exercising the engine by hand
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::TransactionConfig;
use crate::error::TransactionError;
use crate::registry::TransactionRegistry;
use crate::transaction::{CommitOutcome, InMemoryRemote, Mutation, TransactionManager, TransactionSummary};
use crate::types::{OperationId, OperationKind, Trigger};
use crate::view::{CacheEntry, DataViewController, InMemoryQueryCache, QueryCache, QueryKey};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown view '{0}'")]
    UnknownView(String),

    #[error("Duplicate view '{0}'")]
    DuplicateView(String),

    #[error("Unknown operation alias '{0}'")]
    UnknownAlias(String),

    #[error("View reconciliation failed: {0}")]
    Engine(#[from] TransactionError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Transaction config for views without their own
    #[serde(default)]
    pub config: Option<TransactionConfig>,
    /// Existing remote rows per endpoint
    #[serde(default)]
    pub seed: BTreeMap<String, Vec<Map<String, Value>>>,
    pub views: Vec<ViewSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewSpec {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub config: Option<TransactionConfig>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Create {
        view: String,
        data: Map<String, Value>,
        #[serde(default, rename = "as")]
        alias: Option<String>,
        #[serde(default)]
        trigger: Trigger,
    },
    Update {
        view: String,
        id: String,
        data: Map<String, Value>,
        #[serde(default, rename = "as")]
        alias: Option<String>,
        #[serde(default)]
        trigger: Trigger,
    },
    Delete {
        view: String,
        id: String,
        #[serde(default, rename = "as")]
        alias: Option<String>,
        #[serde(default)]
        trigger: Trigger,
    },
    /// Undo the operation recorded under `op`
    Remove { view: String, op: String },
    Review { view: String },
    Commit { view: String },
    Cancel { view: String },
    CommitAll,
    CancelAll,
    Rollback { view: String },
    /// Make the remote reject the next call for entity `id`
    Fail {
        id: String,
        #[serde(default = "default_failure")]
        message: String,
    },
    Select { view: String, id: String },
    Page { view: String, page: u32 },
    Show { view: String },
}

fn default_failure() -> String {
    "injected failure".to_string()
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Create { .. } => "create",
            Step::Update { .. } => "update",
            Step::Delete { .. } => "delete",
            Step::Remove { .. } => "remove",
            Step::Review { .. } => "review",
            Step::Commit { .. } => "commit",
            Step::Cancel { .. } => "cancel",
            Step::CommitAll => "commit_all",
            Step::CancelAll => "cancel_all",
            Step::Rollback { .. } => "rollback",
            Step::Fail { .. } => "fail",
            Step::Select { .. } => "select",
            Step::Page { .. } => "page",
            Step::Show { .. } => "show",
        }
    }
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Outcome of one step; engine errors are reported here rather than aborting the run
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: String,
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub data: Value,
}

type StepResult = Result<(String, Value), TransactionError>;

/// Views, registry and remote wired together for one scenario
pub struct Simulator {
    remote: Arc<InMemoryRemote>,
    cache: Arc<InMemoryQueryCache>,
    registry: Arc<TransactionRegistry>,
    views: BTreeMap<String, DataViewController>,
    aliases: HashMap<String, OperationId>,
}

impl Simulator {
    pub fn new(scenario: &Scenario) -> Result<Self, ScenarioError> {
        let remote = Arc::new(InMemoryRemote::new());
        for (endpoint, rows) in &scenario.seed {
            remote.seed(endpoint, rows.iter().cloned());
        }
        let cache = Arc::new(InMemoryQueryCache::new());
        let registry = Arc::new(TransactionRegistry::new());

        let mut views = BTreeMap::new();
        for spec in &scenario.views {
            if views.contains_key(&spec.id) {
                return Err(ScenarioError::DuplicateView(spec.id.clone()));
            }
            let config = spec
                .config
                .clone()
                .or_else(|| scenario.config.clone())
                .unwrap_or_else(|| crate::config::config().transaction.clone());
            let manager = Arc::new(TransactionManager::with_config(spec.endpoint.clone(), config));
            let key = QueryKey::new(spec.endpoint.clone()).page_size(spec.page_size.unwrap_or(25));
            let view = DataViewController::mount(spec.id.clone(), manager, cache.clone(), key, Some(registry.clone()));
            views.insert(spec.id.clone(), view);
        }

        Ok(Self {
            remote,
            cache,
            registry,
            views,
            aliases: HashMap::new(),
        })
    }

    pub fn remote(&self) -> &Arc<InMemoryRemote> {
        &self.remote
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn summary(&self) -> TransactionSummary {
        self.registry.get_combined_summary()
    }

    pub async fn run(&mut self, steps: &[Step]) -> Result<Vec<StepReport>, ScenarioError> {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            reports.push(self.apply(index, step).await?);
        }
        Ok(reports)
    }

    pub async fn apply(&mut self, index: usize, step: &Step) -> Result<StepReport, ScenarioError> {
        tracing::debug!("Scenario step {}: {}", index, step.name());
        let result = self.execute(step).await?;

        // Registry-wide steps change managers behind the views' backs
        for view in self.views.values_mut() {
            view.sync().await?;
        }

        Ok(match result {
            Ok((message, data)) => StepReport {
                index,
                step: step.name().to_string(),
                ok: true,
                message,
                error_code: None,
                data,
            },
            Err(e) => StepReport {
                index,
                step: step.name().to_string(),
                ok: false,
                message: e.message(),
                error_code: Some(e.error_code().to_string()),
                data: Value::Null,
            },
        })
    }

    async fn execute(&mut self, step: &Step) -> Result<StepResult, ScenarioError> {
        let mutation: Arc<dyn Mutation> = self.remote.clone();

        let result = match step {
            Step::Create { view, data, alias, trigger } => {
                self.edit(view, OperationKind::Create, data.clone(), alias, *trigger, mutation).await?
            }
            Step::Update { view, id, data, alias, trigger } => {
                let mut entity = data.clone();
                entity.insert("id".to_string(), Value::String(id.clone()));
                self.edit(view, OperationKind::Update, entity, alias, *trigger, mutation).await?
            }
            Step::Delete { view, id, alias, trigger } => {
                let mut entity = Map::new();
                entity.insert("id".to_string(), Value::String(id.clone()));
                self.edit(view, OperationKind::Delete, entity, alias, *trigger, mutation).await?
            }
            Step::Remove { view, op } => {
                let id = *self.aliases.get(op).ok_or_else(|| ScenarioError::UnknownAlias(op.clone()))?;
                let ctl = self.view_mut(view)?;
                ctl.remove_operation(id).await.map(|removed| {
                    let message = if removed {
                        format!("Removed operation '{}'", op)
                    } else {
                        format!("Operation '{}' is no longer current; nothing removed", op)
                    };
                    (message, json!({ "removed": removed }))
                })
            }
            Step::Review { view } => self
                .view_mut(view)?
                .review()
                .map(|()| (format!("View {} ready to commit", view), Value::Null)),
            Step::Commit { view } => self.view_mut(view)?.commit().await.map(|outcome| commit_report(&outcome)),
            Step::Cancel { view } => self
                .view_mut(view)?
                .cancel()
                .await
                .map(|()| (format!("Discarded pending changes in {}", view), Value::Null)),
            Step::CommitAll => {
                let results = self.registry.commit_all().await;
                let mut data = Map::new();
                for (id, result) in &results {
                    let entry = match result {
                        Ok(outcome) => commit_report(outcome).1,
                        Err(e) => json!({ "error": e.message(), "error_code": e.error_code() }),
                    };
                    data.insert(id.clone(), entry);
                }
                Ok((format!("Committed {} views", results.len()), Value::Object(data)))
            }
            Step::CancelAll => {
                let errors = self.registry.cancel_all();
                let data: Map<String, Value> = errors
                    .iter()
                    .map(|(id, e)| (id.clone(), json!({ "error": e.message(), "error_code": e.error_code() })))
                    .collect();
                Ok(("Discarded pending changes in all views".to_string(), Value::Object(data)))
            }
            Step::Rollback { view } => self
                .view_mut(view)?
                .manager()
                .rollback()
                .await
                .map(|outcome| commit_report(&outcome)),
            Step::Fail { id, message } => {
                self.remote.fail_next(id.as_str(), message.clone());
                Ok((format!("Next call for {} will fail", id), Value::Null))
            }
            Step::Select { view, id } => {
                let ctl = self.view_mut(view)?;
                ctl.select(id.as_str());
                Ok((format!("Selected {}", id), json!({ "selection": ctl.selection() })))
            }
            Step::Page { view, page } => {
                let ctl = self.view_mut(view)?;
                let key = ctl.query_key().clone().page(*page);
                ctl.set_query_key(key);
                Ok((format!("View {} on page {}", view, page), Value::Null))
            }
            Step::Show { view } => self.show(view).await?,
        };
        Ok(result)
    }

    async fn edit(
        &mut self,
        view: &str,
        kind: OperationKind,
        entity: Map<String, Value>,
        alias: &Option<String>,
        trigger: Trigger,
        mutation: Arc<dyn Mutation>,
    ) -> Result<StepResult, ScenarioError> {
        let (remote, cache) = (self.remote.clone(), self.cache.clone());
        let ctl = self.view_mut(view)?;
        if let Err(e) = load_page(&remote, &cache, ctl.query_key()).await {
            return Ok(Err(e));
        }

        let result = ctl.add_transaction_operation(kind, entity, mutation, trigger, None).await;
        if let (Ok(id), Some(alias)) = (&result, alias) {
            self.aliases.insert(alias.clone(), *id);
        }
        Ok(result.map(|id| (format!("Queued {} ({})", kind, id), json!({ "operation_id": id.to_string() }))))
    }

    async fn show(&mut self, view: &str) -> Result<StepResult, ScenarioError> {
        let (remote, cache) = (self.remote.clone(), self.cache.clone());
        let ctl = self.view_mut(view)?;
        if let Err(e) = load_page(&remote, &cache, ctl.query_key()).await {
            return Ok(Err(e));
        }

        let rows = match ctl.rows().await {
            Ok(rows) => rows,
            Err(e) => return Ok(Err(e)),
        };
        let manager = ctl.manager();
        let data = json!({
            "view": view,
            "query": ctl.query_key().to_string(),
            "status": manager.status(),
            "pending": manager.operation_count(),
            "rows": rows,
        });
        Ok(Ok((format!("{} rows, {} pending", rows.len(), manager.operation_count()), data)))
    }

    fn view_mut(&mut self, id: &str) -> Result<&mut DataViewController, ScenarioError> {
        self.views.get_mut(id).ok_or_else(|| ScenarioError::UnknownView(id.to_string()))
    }
}

/// Simulate a refetch of the current page when the cache has nothing for it
async fn load_page(remote: &InMemoryRemote, cache: &InMemoryQueryCache, key: &QueryKey) -> Result<(), TransactionError> {
    if cache.read(key).await?.is_some() {
        return Ok(());
    }

    let rows = remote.rows(&key.endpoint);
    let total = rows.len() as u64;
    let start = key.page.saturating_sub(1) as usize * key.page_size as usize;
    let page = rows.into_iter().skip(start).take(key.page_size as usize).collect();
    cache.insert(key.clone(), CacheEntry { rows: page, total }).await;
    tracing::trace!("Loaded {} from remote", key);
    Ok(())
}

fn commit_report(outcome: &CommitOutcome) -> (String, Value) {
    let results: Vec<Value> = outcome
        .results
        .iter()
        .map(|r| {
            json!({
                "operation_id": r.operation_id.to_string(),
                "entity_id": r.entity_id,
                "kind": r.kind,
                "outcome": r.outcome,
                "error": r.error.as_ref().map(|e| e.message()),
            })
        })
        .collect();

    let message = format!(
        "Transaction {:?}: {} applied, {} failed",
        outcome.status,
        outcome.applied_count(),
        outcome.failures().count()
    );
    let data = json!({
        "transaction_id": outcome.transaction_id.to_string(),
        "status": outcome.status,
        "duration_ms": outcome.duration.as_millis() as u64,
        "results": results,
    });
    (message, data)
}
