use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::graph::{TextUnit, read_records, tables, write_records};
use crate::index::context::PipelineRunContext;
use crate::index::operations::ClaimExtraction;
use crate::index::prompts::{EXTRACT_CLAIMS_PROMPT, delimiters, render, resolve_prompt};
use crate::index::workflow::{Workflow, WorkflowFuture, WorkflowOutput};

/// Extracts claims when `extract_claims.enabled` is set
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractCovariates;

impl Workflow for ExtractCovariates {
    fn name(&self) -> &'static str {
        "extract_covariates"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(extract_covariates(config, ctx))
    }
}

async fn extract_covariates(config: &Config, ctx: &mut PipelineRunContext) -> Result<WorkflowOutput> {
    let settings = &config.extract_claims;
    if !settings.enabled {
        info!("Claim extraction disabled, skipping");
        return Ok(WorkflowOutput::default());
    }

    let text_units: Vec<TextUnit> = read_records(ctx.output.as_ref(), tables::TEXT_UNITS).await?;
    let gateway = ctx.completion(&settings.completion_model_id, &settings.model_instance_name)?;
    let template = resolve_prompt(config, settings.prompt.as_deref(), EXTRACT_CLAIMS_PROMPT).await?;

    let entity_specs = config.extract_graph.entity_types.join(", ");
    let mut values: Vec<(&str, &str)> = delimiters().to_vec();
    values.push(("entity_specs", &entity_specs));
    values.push(("claim_description", &settings.description));
    let prompt = render(&template, &values);

    let covariates = ClaimExtraction {
        gateway: &gateway,
        prompt: &prompt,
        max_gleanings: settings.max_gleanings,
        concurrency: config.concurrent_requests,
    }
    .run(&text_units, &ctx.cancel)
    .await?;

    write_records(ctx.output.as_ref(), tables::COVARIATES, &covariates).await?;
    Ok(WorkflowOutput::with_result(json!({ "covariates": covariates.len() })))
}
