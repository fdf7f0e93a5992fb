//! Workflows that fold the delta output into the base graph

use std::collections::HashSet;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{
    Community, Covariate, Document, Entity, Relationship, Row, TableProvider, TextUnit,
    read_records_or_empty, tables, write_records,
};
use crate::index::context::{PipelineRunContext, UPDATE_STATE_PREFIX};
use crate::index::operations::finalize_graph;
use crate::index::workflow::{Workflow, WorkflowFuture, WorkflowOutput};
use crate::merge::{GraphTables, IdMapping, IncrementalMergeEngine, merge_communities};

use super::extract_graph::summarize_graph;

pub const FINAL_DOCUMENTS_KEY: &str = "incremental_update_final_documents";
pub const MERGED_ENTITIES_KEY: &str = "incremental_update_merged_entities";
pub const MERGED_RELATIONSHIPS_KEY: &str = "incremental_update_merged_relationships";
pub const ENTITY_ID_MAPPING_KEY: &str = "incremental_update_entity_id_mapping";
pub const RELATIONSHIP_ID_MAPPING_KEY: &str = "incremental_update_relationship_id_mapping";
pub const COMMUNITY_ID_MAPPING_KEY: &str = "incremental_update_community_id_mapping";

fn put_state<T: Serialize>(ctx: &mut PipelineRunContext, key: &str, value: &T) -> Result<()> {
    ctx.state.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(())
}

fn take_state<T: DeserializeOwned>(ctx: &PipelineRunContext, key: &str, workflow: &str) -> Result<T> {
    let value = ctx.state.get(key).cloned().ok_or_else(|| {
        Error::InvalidInput(format!(
            "workflow '{}' needs run state '{}' from an earlier update workflow",
            workflow, key
        ))
    })?;
    Ok(serde_json::from_value(value)?)
}

/// Base rows followed by delta rows whose id is not already present
fn append_new<T>(base: Vec<T>, delta: Vec<T>, id: impl Fn(&T) -> &str) -> Vec<T> {
    let seen: HashSet<String> = base.iter().map(|row| id(row).to_string()).collect();
    let mut merged = base;
    merged.extend(delta.into_iter().filter(|row| !seen.contains(id(row))));
    merged
}

/// Appends new documents and text units to the base tables
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateFinalDocuments;

impl Workflow for UpdateFinalDocuments {
    fn name(&self) -> &'static str {
        "update_final_documents"
    }

    fn run<'a>(&'a self, _config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let update = ctx.update_stores(self.name())?.clone();
            let previous = update.previous.as_ref();
            let delta = ctx.output.as_ref();

            let mut documents = append_new(
                read_records_or_empty::<Document>(previous, tables::DOCUMENTS).await?,
                read_records_or_empty::<Document>(delta, tables::DOCUMENTS).await?,
                |d| &d.id,
            );
            for (index, document) in documents.iter_mut().enumerate() {
                document.human_readable_id = index as u64;
            }
            let mut text_units = append_new(
                read_records_or_empty::<TextUnit>(previous, tables::TEXT_UNITS).await?,
                read_records_or_empty::<TextUnit>(delta, tables::TEXT_UNITS).await?,
                |t| &t.id,
            );
            for (index, unit) in text_units.iter_mut().enumerate() {
                unit.human_readable_id = index as u64;
            }

            write_records(update.merged.as_ref(), tables::DOCUMENTS, &documents).await?;
            write_records(update.merged.as_ref(), tables::TEXT_UNITS, &text_units).await?;

            let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
            put_state(ctx, FINAL_DOCUMENTS_KEY, &ids)?;
            info!(
                documents = documents.len(),
                text_units = text_units.len(),
                "Updated final documents"
            );
            Ok(WorkflowOutput::with_result(json!({ "documents": documents.len() })))
        })
    }
}

/// Merges delta entities and relationships into the base graph
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateEntitiesRelationships;

impl Workflow for UpdateEntitiesRelationships {
    fn name(&self) -> &'static str {
        "update_entities_relationships"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(update_entities_relationships(self.name(), config, ctx))
    }
}

async fn update_entities_relationships(
    workflow: &str,
    config: &Config,
    ctx: &mut PipelineRunContext,
) -> Result<WorkflowOutput> {
    let update = ctx.update_stores(workflow)?.clone();
    let previous = update.previous.as_ref();
    let delta = ctx.output.as_ref();

    let base = GraphTables {
        entities: read_records_or_empty(previous, tables::ENTITIES).await?,
        relationships: read_records_or_empty(previous, tables::RELATIONSHIPS).await?,
        communities: Vec::new(),
    };
    let incoming = GraphTables {
        entities: read_records_or_empty(delta, tables::ENTITIES).await?,
        relationships: read_records_or_empty(delta, tables::RELATIONSHIPS).await?,
        communities: Vec::new(),
    };

    let merged = IncrementalMergeEngine::load(base, incoming).reconcile()?;
    let mut entities: Vec<Entity> = merged.tables.entities;
    let mut relationships: Vec<Relationship> = merged.tables.relationships;

    summarize_graph(config, ctx, &mut entities, &mut relationships).await?;
    finalize_graph(&mut entities, &mut relationships);

    write_records(update.merged.as_ref(), tables::ENTITIES, &entities).await?;
    write_records(update.merged.as_ref(), tables::RELATIONSHIPS, &relationships).await?;
    if delta.has_table(tables::TYPE_PROPOSALS).await? {
        let proposals: Vec<Row> = delta.read_table(tables::TYPE_PROPOSALS).await?;
        update.merged.write_table(tables::TYPE_PROPOSALS, proposals).await?;
    }

    put_state(ctx, ENTITY_ID_MAPPING_KEY, &merged.entity_mapping)?;
    put_state(ctx, RELATIONSHIP_ID_MAPPING_KEY, &merged.relationship_mapping)?;
    put_state(ctx, MERGED_ENTITIES_KEY, &entities)?;
    put_state(ctx, MERGED_RELATIONSHIPS_KEY, &relationships)?;

    info!(
        entities = entities.len(),
        relationships = relationships.len(),
        folded = merged.entity_mapping.remapped().count(),
        "Updated entities and relationships"
    );
    Ok(WorkflowOutput::with_result(json!({
        "entities": entities.len(),
        "relationships": relationships.len(),
    })))
}

/// Merges delta communities using the mappings from the entity merge
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateCommunities;

impl Workflow for UpdateCommunities {
    fn name(&self) -> &'static str {
        "update_communities"
    }

    fn run<'a>(&'a self, _config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let update = ctx.update_stores(self.name())?.clone();
            let base: Vec<Community> =
                read_records_or_empty(update.previous.as_ref(), tables::COMMUNITIES).await?;
            let delta: Vec<Community> =
                read_records_or_empty(ctx.output.as_ref(), tables::COMMUNITIES).await?;
            if base.is_empty() && delta.is_empty() {
                info!("No communities to update");
                return Ok(WorkflowOutput::default());
            }

            let entity_mapping: IdMapping = take_state(ctx, ENTITY_ID_MAPPING_KEY, self.name())?;
            let relationship_mapping: IdMapping =
                take_state(ctx, RELATIONSHIP_ID_MAPPING_KEY, self.name())?;
            let merged = merge_communities(&base, &delta, &entity_mapping, &relationship_mapping)?;

            write_records(update.merged.as_ref(), tables::COMMUNITIES, &merged.communities).await?;
            put_state(ctx, COMMUNITY_ID_MAPPING_KEY, &merged.mapping)?;
            info!(
                communities = merged.communities.len(),
                "Updated communities"
            );
            Ok(WorkflowOutput::with_result(json!({
                "communities": merged.communities.len(),
            })))
        })
    }
}

/// Appends delta claims to the base claims
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateCovariates;

impl Workflow for UpdateCovariates {
    fn name(&self) -> &'static str {
        "update_covariates"
    }

    fn run<'a>(&'a self, _config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let update = ctx.update_stores(self.name())?.clone();
            let base: Vec<Covariate> =
                read_records_or_empty(update.previous.as_ref(), tables::COVARIATES).await?;
            let delta: Vec<Covariate> =
                read_records_or_empty(ctx.output.as_ref(), tables::COVARIATES).await?;
            if base.is_empty() && delta.is_empty() {
                return Ok(WorkflowOutput::default());
            }

            let mut covariates = append_new(base, delta, |c| &c.id);
            for (index, covariate) in covariates.iter_mut().enumerate() {
                covariate.human_readable_id = index as u64;
            }
            write_records(update.merged.as_ref(), tables::COVARIATES, &covariates).await?;
            Ok(WorkflowOutput::with_result(json!({ "covariates": covariates.len() })))
        })
    }
}

/// Drops the update workflows' run-state keys
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateCleanState;

impl Workflow for UpdateCleanState {
    fn name(&self) -> &'static str {
        "update_clean_state"
    }

    fn run<'a>(&'a self, _config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let removed: Vec<String> = ctx
                .state
                .keys()
                .filter(|key| key.starts_with(UPDATE_STATE_PREFIX))
                .cloned()
                .collect();
            for key in &removed {
                ctx.state.remove(key);
            }
            info!(removed = removed.len(), "Cleaned update state");
            Ok(WorkflowOutput::with_result(Value::from(removed.len())))
        })
    }
}
