//! Run context shared by the workflows of one pipeline run

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::graph::{StagedTableProvider, TableProvider};
use crate::llm::{CompletionFactory, LlmCompletion};

/// Run-scoped state passed between sequential workflows
pub type RunState = serde_json::Map<String, Value>;

/// Prefix of state keys owned by the update workflows
pub const UPDATE_STATE_PREFIX: &str = "incremental_update_";

/// Run-state key holding the update run's timestamp
pub const UPDATE_TIMESTAMP_KEY: &str = "update_timestamp";

/// Timing for one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunStats {
    pub overall_secs: f64,
}

/// Timing and volume for a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunStats {
    pub total_runtime_secs: f64,
    pub num_documents: usize,
    pub workflows: BTreeMap<String, WorkflowRunStats>,
}

/// Stores only present on update runs
#[derive(Debug, Clone)]
pub struct UpdateStores {
    /// The persisted base graph
    pub previous: Arc<dyn TableProvider>,
    /// Merged output, committed over the base graph on success
    pub merged: Arc<StagedTableProvider>,
    /// Copy of the base tables taken before the merged output lands
    pub backup: Arc<dyn TableProvider>,
    pub timestamp: String,
}

/// Everything a workflow can touch.
///
/// On standard runs `output` is the final output store; on update runs it
/// is the delta store and the update workflows write to
/// [`UpdateStores::merged`]. All writes are staged until [`commit`](Self::commit).
pub struct PipelineRunContext {
    pub input: Arc<dyn TableProvider>,
    pub output: Arc<StagedTableProvider>,
    pub update: Option<UpdateStores>,
    pub cache: Cache,
    pub completions: Arc<CompletionFactory>,
    pub state: RunState,
    pub cancel: CancellationToken,
    pub stats: PipelineRunStats,
}

impl std::fmt::Debug for PipelineRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunContext")
            .field("update", &self.update.as_ref().map(|u| &u.timestamp))
            .field("state_keys", &self.state.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineRunContext {
    /// Gateway for a workflow's model instance
    pub fn completion(&self, model_id: &str, instance_name: &str) -> Result<LlmCompletion> {
        self.completions.get(model_id, instance_name)
    }

    /// Update stores, or an error naming the workflow that needed them
    pub fn update_stores(&self, workflow: &str) -> Result<&UpdateStores> {
        self.update.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("workflow '{}' only runs as part of an update", workflow))
        })
    }

    /// Fail fast when the run has been cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Write every staged table to its store.
    ///
    /// On update runs the delta lands first, then the base tables are copied
    /// to the backup store, then the merged tables replace the base.
    pub async fn commit(&self) -> Result<Vec<String>> {
        let mut committed = self.output.commit().await?;
        if let Some(update) = &self.update {
            let merged_tables = update.merged.staged_tables().await;
            for name in &merged_tables {
                if update.previous.has_table(name).await? {
                    let rows = update.previous.read_table(name).await?;
                    update.backup.write_table(name, rows).await?;
                }
            }
            committed.extend(update.merged.commit().await?);
        }
        info!(tables = ?committed, "Committed run output");
        Ok(committed)
    }

    /// Drop every staged table
    pub async fn discard(&self) {
        self.output.discard().await;
        if let Some(update) = &self.update {
            update.merged.discard().await;
        }
    }
}
