//! Workflow trait, registry and sequential pipeline

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::Registry;

use super::context::{PipelineRunContext, WorkflowRunStats};
use super::workflows;

/// Result of one workflow
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowOutput {
    /// Optional summary value for callers and tests
    pub result: Option<Value>,
    /// Stop the pipeline after this workflow
    pub stop: bool,
}

impl WorkflowOutput {
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            stop: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            result: None,
            stop: true,
        }
    }
}

pub type WorkflowFuture<'a> = Pin<Box<dyn Future<Output = Result<WorkflowOutput>> + Send + 'a>>;

/// One named pipeline step
///
/// Workflows run strictly one after another and own the run context for the
/// duration of their call.
pub trait Workflow: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext)
    -> WorkflowFuture<'a>;
}

/// Workflow name → implementation
pub type WorkflowRegistry = Registry<dyn Workflow>;

/// Workflows of a standard indexing run, in order
pub const STANDARD_WORKFLOWS: &[&str] = &[
    "load_input",
    "extract_graph",
    "extract_covariates",
    "prune_graph",
    "finalize_graph",
];

/// Workflows appended to the standard ones on an update run
pub const UPDATE_WORKFLOWS: &[&str] = &[
    "update_final_documents",
    "update_entities_relationships",
    "update_communities",
    "update_covariates",
    "update_clean_state",
];

/// Registry with every built-in workflow
pub fn default_workflows() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new("workflow");
    let builtins: Vec<Arc<dyn Workflow>> = vec![
        Arc::new(workflows::LoadInput),
        Arc::new(workflows::ExtractGraph),
        Arc::new(workflows::SummarizeDescriptions),
        Arc::new(workflows::ExtractCovariates),
        Arc::new(workflows::PruneGraph),
        Arc::new(workflows::FinalizeGraph),
        Arc::new(workflows::UpdateFinalDocuments),
        Arc::new(workflows::UpdateEntitiesRelationships),
        Arc::new(workflows::UpdateCommunities),
        Arc::new(workflows::UpdateCovariates),
        Arc::new(workflows::UpdateCleanState),
    ];
    for workflow in builtins {
        registry.register(workflow.name(), workflow);
    }
    registry
}

/// Ordered list of resolved workflows
#[derive(Clone)]
pub struct Pipeline {
    steps: Vec<(String, Arc<dyn Workflow>)>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("steps", &self.names()).finish()
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// Workflows that ran, in order
    pub completed: Vec<String>,
    /// Set when a workflow asked to stop early
    pub stopped_by: Option<String>,
}

impl Pipeline {
    /// Resolve `names` against `registry`
    pub fn from_names<S: AsRef<str>>(names: &[S], registry: &WorkflowRegistry) -> Result<Self> {
        let steps = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                registry
                    .get(name)
                    .map(|workflow| (name.to_string(), workflow))
                    .map_err(|_| Error::UnknownWorkflow(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Run every workflow in order.
    ///
    /// The first failure aborts the run and is wrapped with the workflow name.
    pub async fn run(&self, config: &Config, ctx: &mut PipelineRunContext) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let mut completed = Vec::new();
        let mut stopped_by = None;

        for (name, workflow) in &self.steps {
            ctx.check_cancelled().map_err(|err| err.in_workflow(name.as_str()))?;

            info!(workflow = %name, "Workflow started");
            let workflow_started = Instant::now();
            let output = match workflow.run(config, ctx).await {
                Ok(output) => output,
                Err(err) => {
                    error!(
                        workflow = %name,
                        code = err.code(),
                        error = %err,
                        "Workflow failed"
                    );
                    return Err(err.in_workflow(name.as_str()));
                }
            };

            let elapsed = workflow_started.elapsed().as_secs_f64();
            ctx.stats.workflows.insert(
                name.clone(),
                WorkflowRunStats {
                    overall_secs: elapsed,
                },
            );
            info!(workflow = %name, elapsed_secs = elapsed, "Workflow completed");
            completed.push(name.clone());

            if output.stop {
                info!(workflow = %name, "Workflow requested pipeline stop");
                stopped_by = Some(name.clone());
                break;
            }
        }

        ctx.stats.total_runtime_secs = started.elapsed().as_secs_f64();
        Ok(PipelineOutcome {
            completed,
            stopped_by,
        })
    }
}
