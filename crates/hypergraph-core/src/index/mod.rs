//! Indexing pipeline
//!
//! - `workflow`: the [`Workflow`] trait, registry and sequential [`Pipeline`]
//! - `workflows`: built-in extraction and update workflows
//! - `operations`: model-backed extraction, summarization and graph passes
//! - `run`: [`IndexRun`], which wires storage, cache and gateways together

pub mod context;
pub mod operations;
pub mod parse;
pub mod prompts;
pub mod run;
pub mod workflow;
pub mod workflows;

pub use context::{
    PipelineRunContext, PipelineRunStats, RunState, UPDATE_STATE_PREFIX, UPDATE_TIMESTAMP_KEY,
    UpdateStores, WorkflowRunStats,
};
pub use run::{BACKUP_DIR, DELTA_DIR, IndexRun, RunMode, RunResult, build_index};
pub use workflow::{
    Pipeline, PipelineOutcome, STANDARD_WORKFLOWS, UPDATE_WORKFLOWS, Workflow, WorkflowFuture,
    WorkflowOutput, WorkflowRegistry, default_workflows,
};
