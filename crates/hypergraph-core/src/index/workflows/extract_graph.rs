use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::canonical::TypeCanonicalizer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{Entity, Relationship, TextUnit, read_records, tables, write_records};
use crate::index::context::PipelineRunContext;
use crate::index::operations::{DescriptionSummarizer, EntityResolver, GraphExtraction};
use crate::index::prompts::{
    EXTRACT_GRAPH_PROMPT, RESOLVE_ENTITIES_PROMPT, SUMMARIZE_PROMPT, delimiters, render,
    resolve_prompt,
};
use crate::index::workflow::{Workflow, WorkflowFuture, WorkflowOutput};

/// Extracts entities and relationships from every text unit
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractGraph;

impl Workflow for ExtractGraph {
    fn name(&self) -> &'static str {
        "extract_graph"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(extract_graph(config, ctx))
    }
}

/// Summarizes multi-description entities and relationships in the output
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizeDescriptions;

impl Workflow for SummarizeDescriptions {
    fn name(&self) -> &'static str {
        "summarize_descriptions"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let mut entities: Vec<Entity> = read_records(ctx.output.as_ref(), tables::ENTITIES).await?;
            let mut relationships: Vec<Relationship> =
                read_records(ctx.output.as_ref(), tables::RELATIONSHIPS).await?;
            summarize_graph(config, ctx, &mut entities, &mut relationships).await?;
            write_records(ctx.output.as_ref(), tables::ENTITIES, &entities).await?;
            write_records(ctx.output.as_ref(), tables::RELATIONSHIPS, &relationships).await?;
            Ok(WorkflowOutput::default())
        })
    }
}

/// Run description summarization with the configured model instance
pub(crate) async fn summarize_graph(
    config: &Config,
    ctx: &PipelineRunContext,
    entities: &mut [Entity],
    relationships: &mut [Relationship],
) -> Result<()> {
    let settings = &config.summarize_descriptions;
    let gateway = ctx.completion(&settings.completion_model_id, &settings.model_instance_name)?;
    let prompt = resolve_prompt(config, settings.prompt.as_deref(), SUMMARIZE_PROMPT).await?;
    DescriptionSummarizer {
        gateway: &gateway,
        prompt: &prompt,
        max_length: settings.max_length,
        max_input_tokens: settings.max_input_tokens,
        concurrency: config.concurrent_requests,
    }
    .run(entities, relationships, &ctx.cancel)
    .await
}

/// Fold duplicate entities when `entity_resolution.enabled`
async fn resolve_entities(
    config: &Config,
    ctx: &PipelineRunContext,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
) -> Result<(Vec<Entity>, Vec<Relationship>)> {
    let settings = &config.entity_resolution;
    if !settings.enabled {
        return Ok((entities, relationships));
    }
    let gateway = ctx.completion(&settings.completion_model_id, &settings.model_instance_name)?;
    let prompt = resolve_prompt(config, settings.prompt.as_deref(), RESOLVE_ENTITIES_PROMPT).await?;
    EntityResolver {
        gateway: &gateway,
        prompt: &prompt,
        concurrency: config.concurrent_requests,
    }
    .run(entities, relationships, &ctx.cancel)
    .await
}

fn extraction_prompt(config: &Config, template: &str) -> String {
    let settings = &config.extract_graph;
    let entity_types = settings.entity_types.join(", ");
    let relationship_types = settings.relationship_types.join(", ");
    let ontology = settings
        .ontology
        .as_deref()
        .map(|text| format!("\n-Ontology-\n{}\n", text.trim()))
        .unwrap_or_default();

    let mut values: Vec<(&str, &str)> = delimiters().to_vec();
    values.push(("entity_types", &entity_types));
    values.push(("relationship_types", &relationship_types));
    values.push(("ontology", &ontology));
    render(template, &values)
}

fn drop_dangling(entities: &[Entity], relationships: &mut Vec<Relationship>) {
    let titles: HashSet<&str> = entities.iter().map(|e| e.title.as_str()).collect();
    let before = relationships.len();
    relationships.retain(|r| titles.contains(r.source.as_str()) && titles.contains(r.target.as_str()));
    let dropped = before - relationships.len();
    if dropped > 0 {
        warn!(dropped, "Dropped relationships with unknown endpoints");
    }
}

async fn extract_graph(config: &Config, ctx: &mut PipelineRunContext) -> Result<WorkflowOutput> {
    let settings = &config.extract_graph;
    let text_units: Vec<TextUnit> = read_records(ctx.output.as_ref(), tables::TEXT_UNITS).await?;
    let gateway = ctx.completion(&settings.completion_model_id, &settings.model_instance_name)?;
    let template = resolve_prompt(config, settings.prompt.as_deref(), EXTRACT_GRAPH_PROMPT).await?;
    let prompt = extraction_prompt(config, &template);

    let (raw_entities, raw_relationships) = GraphExtraction {
        gateway: &gateway,
        prompt: &prompt,
        max_gleanings: settings.max_gleanings,
        concurrency: config.concurrent_requests,
    }
    .run(&text_units, &ctx.cancel)
    .await?;

    let canonicalizer = TypeCanonicalizer::from_config(settings);
    let proposals = canonicalizer.build_proposals(&raw_entities, &raw_relationships);
    let (entities, relationships) = canonicalizer.enforce(raw_entities, raw_relationships);
    let (mut entities, mut relationships) =
        resolve_entities(config, ctx, entities, relationships).await?;
    drop_dangling(&entities, &mut relationships);

    if entities.is_empty() {
        return Err(Error::EmptyExtractionResult {
            table: tables::ENTITIES.to_string(),
        });
    }
    if relationships.is_empty() {
        return Err(Error::EmptyExtractionResult {
            table: tables::RELATIONSHIPS.to_string(),
        });
    }

    if config.snapshots.raw_graph {
        write_records(ctx.output.as_ref(), tables::RAW_ENTITIES, &entities).await?;
        write_records(ctx.output.as_ref(), tables::RAW_RELATIONSHIPS, &relationships).await?;
    }

    summarize_graph(config, ctx, &mut entities, &mut relationships).await?;
    for (index, entity) in entities.iter_mut().enumerate() {
        entity.human_readable_id = index as u64;
    }
    for (index, relationship) in relationships.iter_mut().enumerate() {
        relationship.human_readable_id = index as u64;
    }

    write_records(ctx.output.as_ref(), tables::ENTITIES, &entities).await?;
    write_records(ctx.output.as_ref(), tables::RELATIONSHIPS, &relationships).await?;
    write_records(ctx.output.as_ref(), tables::TYPE_PROPOSALS, &proposals).await?;

    info!(
        entities = entities.len(),
        relationships = relationships.len(),
        proposals = proposals.len(),
        "Graph extraction complete"
    );
    Ok(WorkflowOutput::with_result(json!({
        "entities": entities.len(),
        "relationships": relationships.len(),
        "type_proposals": proposals.len(),
    })))
}
