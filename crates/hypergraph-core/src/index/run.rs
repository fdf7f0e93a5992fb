//! Indexing run orchestration
//!
//! [`IndexRun`] wires configuration, storage, cache and completion gateways
//! into a [`PipelineRunContext`], runs the pipeline, and commits the staged
//! output only when every workflow succeeded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{Cache, CacheBackendRegistry, default_cache_backends};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{JsonlTableProvider, StagedTableProvider, TableProvider};
use crate::llm::{CompletionFactory, MetricsStore, ModelMetrics, Registries};

use super::context::{PipelineRunContext, PipelineRunStats, RunState, UPDATE_TIMESTAMP_KEY, UpdateStores};
use super::workflow::{
    Pipeline, STANDARD_WORKFLOWS, UPDATE_WORKFLOWS, WorkflowRegistry, default_workflows,
};

/// Directory under an update run's folder holding the delta graph
pub const DELTA_DIR: &str = "delta";
/// Directory under an update run's folder holding the replaced base tables
pub const BACKUP_DIR: &str = "previous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Build the graph from scratch into the output store
    Standard,
    /// Index new documents and merge them into the existing output
    Update,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub mode: RunMode,
    /// Workflows that ran, in order
    pub workflows: Vec<String>,
    /// Workflow that asked the pipeline to stop, if any
    pub stopped_by: Option<String>,
    pub state: RunState,
    pub stats: PipelineRunStats,
    pub metrics: BTreeMap<String, ModelMetrics>,
    /// Tables written to storage
    pub committed: Vec<String>,
}

/// Builder for one indexing run
pub struct IndexRun {
    config: Arc<Config>,
    mode: RunMode,
    registries: Registries,
    workflows: WorkflowRegistry,
    cache_backends: CacheBackendRegistry,
    cache: Option<Cache>,
    state: RunState,
    cancel: CancellationToken,
    metrics: MetricsStore,
    timestamp: Option<String>,
}

impl IndexRun {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            mode: RunMode::Standard,
            registries: Registries::default(),
            workflows: default_workflows(),
            cache_backends: default_cache_backends(),
            cache: None,
            state: RunState::new(),
            cancel: CancellationToken::new(),
            metrics: MetricsStore::default(),
            timestamp: None,
        }
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Provider, rate limiter and retry registries
    pub fn registries(mut self, registries: Registries) -> Self {
        self.registries = registries;
        self
    }

    pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn cache_backends(mut self, backends: CacheBackendRegistry) -> Self {
        self.cache_backends = backends;
        self
    }

    /// Use this cache instead of the one named by `cache.backend`
    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Initial run state
    pub fn state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn metrics(mut self, metrics: MetricsStore) -> Self {
        self.metrics = metrics;
        self
    }

    /// Folder name of an update run under `update_output_storage`
    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Workflow names this run will execute
    pub fn pipeline_names(&self) -> Vec<String> {
        if let Some(names) = &self.config.workflows {
            return names.clone();
        }
        let mut names: Vec<String> = STANDARD_WORKFLOWS.iter().map(|s| s.to_string()).collect();
        if self.mode == RunMode::Update {
            names.extend(UPDATE_WORKFLOWS.iter().map(|s| s.to_string()));
        }
        names
    }

    fn build_cache(&self) -> Result<Cache> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone());
        }
        let settings = &self.config.cache;
        let factory = self.cache_backends.get(&settings.backend)?;
        Ok(Cache::new(factory(&settings.base_dir)?))
    }

    fn build_context(self, cache: Cache) -> (Arc<Config>, PipelineRunContext) {
        let config = self.config;
        let input: Arc<dyn TableProvider> =
            Arc::new(JsonlTableProvider::new(&config.input_storage.base_dir));
        let base: Arc<dyn TableProvider> =
            Arc::new(JsonlTableProvider::new(&config.output_storage.base_dir));
        let mut state = self.state;

        let (output, update) = match self.mode {
            RunMode::Standard => (Arc::new(StagedTableProvider::new(base)), None),
            RunMode::Update => {
                let timestamp = self
                    .timestamp
                    .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string());
                let run_dir = config.update_output_storage.base_dir.join(&timestamp);
                let delta: Arc<dyn TableProvider> =
                    Arc::new(JsonlTableProvider::new(run_dir.join(DELTA_DIR)));
                state.insert(UPDATE_TIMESTAMP_KEY.to_string(), Value::String(timestamp.clone()));
                let stores = UpdateStores {
                    previous: Arc::clone(&base),
                    merged: Arc::new(StagedTableProvider::new(base)),
                    backup: Arc::new(JsonlTableProvider::new(run_dir.join(BACKUP_DIR))),
                    timestamp,
                };
                (Arc::new(StagedTableProvider::new(delta)), Some(stores))
            }
        };

        let completions = Arc::new(CompletionFactory::new(
            Arc::clone(&config),
            cache.clone(),
            self.metrics,
            self.registries,
        ));
        let ctx = PipelineRunContext {
            input,
            output,
            update,
            cache,
            completions,
            state,
            cancel: self.cancel,
            stats: PipelineRunStats::default(),
        };
        (config, ctx)
    }

    /// Execute the pipeline.
    ///
    /// Output is committed only when every workflow succeeds; on failure all
    /// staged tables are discarded and storage is left as it was.
    pub async fn run(self) -> Result<RunResult> {
        self.config
            .validate()
            .map_err(|err| Error::ConfigError(err.to_string()))?;
        let names = self.pipeline_names();
        let pipeline = Pipeline::from_names(names.as_slice(), &self.workflows)?;
        let cache = self.build_cache()?;
        let mode = self.mode;

        info!(
            mode = %mode,
            workflows = ?names,
            cache = cache.backend_name(),
            "Starting indexing run"
        );
        let (config, mut ctx) = self.build_context(cache);

        let outcome = match pipeline.run(&config, &mut ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                ctx.discard().await;
                error!(
                    workflow = err.workflow().unwrap_or("-"),
                    code = err.code(),
                    error = %err,
                    "Indexing run failed, output discarded"
                );
                return Err(err);
            }
        };

        let committed = ctx.commit().await?;
        info!(
            mode = %mode,
            workflows = outcome.completed.len(),
            tables = committed.len(),
            elapsed_secs = ctx.stats.total_runtime_secs,
            "Indexing run complete"
        );
        Ok(RunResult {
            mode,
            workflows: outcome.completed,
            stopped_by: outcome.stopped_by,
            metrics: ctx.completions.metrics().snapshot(),
            state: ctx.state,
            stats: ctx.stats,
            committed,
        })
    }
}

/// Run the default pipeline for `mode` with default registries
pub async fn build_index(config: Config, mode: RunMode) -> Result<RunResult> {
    IndexRun::new(config).mode(mode).run().await
}
