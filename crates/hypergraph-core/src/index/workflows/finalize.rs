use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::graph::{Entity, Relationship, read_records, tables, write_records};
use crate::index::context::PipelineRunContext;
use crate::index::operations::{finalize_graph, prune_graph};
use crate::index::workflow::{Workflow, WorkflowFuture, WorkflowOutput};

/// Drops weak parts of the graph when `prune_graph.enabled` is set
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneGraph;

impl Workflow for PruneGraph {
    fn name(&self) -> &'static str {
        "prune_graph"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            if !config.prune_graph.enabled {
                info!("Graph pruning disabled, skipping");
                return Ok(WorkflowOutput::default());
            }
            let store = ctx.output.as_ref();
            let entities: Vec<Entity> = read_records(store, tables::ENTITIES).await?;
            let relationships: Vec<Relationship> = read_records(store, tables::RELATIONSHIPS).await?;

            let (entities, relationships) = prune_graph(entities, relationships, &config.prune_graph)?;
            write_records(store, tables::ENTITIES, &entities).await?;
            write_records(store, tables::RELATIONSHIPS, &relationships).await?;
            Ok(WorkflowOutput::with_result(json!({
                "entities": entities.len(),
                "relationships": relationships.len(),
            })))
        })
    }
}

/// Assigns degrees and dense sequence numbers
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizeGraph;

impl Workflow for FinalizeGraph {
    fn name(&self) -> &'static str {
        "finalize_graph"
    }

    fn run<'a>(&'a self, _config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let store = ctx.output.as_ref();
            let mut entities: Vec<Entity> = read_records(store, tables::ENTITIES).await?;
            let mut relationships: Vec<Relationship> = read_records(store, tables::RELATIONSHIPS).await?;
            finalize_graph(&mut entities, &mut relationships);
            write_records(store, tables::ENTITIES, &entities).await?;
            write_records(store, tables::RELATIONSHIPS, &relationships).await?;
            Ok(WorkflowOutput::default())
        })
    }
}
