use std::collections::HashSet;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{
    Community, Document, TextUnit, read_records, read_records_or_empty, tables, write_records,
};
use crate::index::context::PipelineRunContext;
use crate::index::operations::estimate_tokens;
use crate::index::workflow::{Workflow, WorkflowFuture, WorkflowOutput};

/// Copies documents, text units and optional communities into the run output
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadInput;

impl Workflow for LoadInput {
    fn name(&self) -> &'static str {
        "load_input"
    }

    fn run<'a>(&'a self, config: &'a Config, ctx: &'a mut PipelineRunContext) -> WorkflowFuture<'a> {
        Box::pin(load_input(config, ctx))
    }
}

fn text_unit_id(document_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("text_unit:{}", document_id).as_bytes()).to_string()
}

/// One text unit per document covering its whole text
fn chunk_documents(documents: &mut [Document]) -> Vec<TextUnit> {
    documents
        .iter_mut()
        .map(|document| {
            let id = text_unit_id(&document.id);
            document.text_unit_ids = vec![id.clone()];
            TextUnit {
                id,
                human_readable_id: 0,
                text: document.text.clone(),
                document_ids: vec![document.id.clone()],
                n_tokens: Some(estimate_tokens(&document.text) as u64),
            }
        })
        .collect()
}

async fn load_input(_config: &Config, ctx: &mut PipelineRunContext) -> Result<WorkflowOutput> {
    if !ctx.input.has_table(tables::DOCUMENTS).await? {
        return Err(Error::InvalidInput(
            "input storage has no documents table".to_string(),
        ));
    }
    let mut documents: Vec<Document> = read_records(ctx.input.as_ref(), tables::DOCUMENTS).await?;
    let total = documents.len();

    if let Some(update) = &ctx.update {
        let previous: Vec<Document> =
            read_records_or_empty(update.previous.as_ref(), tables::DOCUMENTS).await?;
        let seen: HashSet<String> = previous.into_iter().map(|d| d.id).collect();
        documents.retain(|d| !seen.contains(&d.id));
        if documents.is_empty() {
            info!(documents = total, "No new documents to index");
            return Ok(WorkflowOutput::stop());
        }
    }
    if documents.is_empty() {
        return Err(Error::InvalidInput("input documents table is empty".to_string()));
    }

    let document_ids: HashSet<String> = documents.iter().map(|d| d.id.clone()).collect();
    let mut text_units = if ctx.input.has_table(tables::TEXT_UNITS).await? {
        let mut units: Vec<TextUnit> = read_records(ctx.input.as_ref(), tables::TEXT_UNITS).await?;
        units.retain(|unit| unit.document_ids.iter().any(|id| document_ids.contains(id)));
        for document in documents.iter_mut().filter(|d| d.text_unit_ids.is_empty()) {
            document.text_unit_ids = units
                .iter()
                .filter(|unit| unit.document_ids.contains(&document.id))
                .map(|unit| unit.id.clone())
                .collect();
        }
        units
    } else {
        chunk_documents(&mut documents)
    };

    for (index, document) in documents.iter_mut().enumerate() {
        document.human_readable_id = index as u64;
    }
    for (index, unit) in text_units.iter_mut().enumerate() {
        unit.human_readable_id = index as u64;
    }

    write_records(ctx.output.as_ref(), tables::DOCUMENTS, &documents).await?;
    write_records(ctx.output.as_ref(), tables::TEXT_UNITS, &text_units).await?;

    let communities: Vec<Community> =
        read_records_or_empty(ctx.input.as_ref(), tables::COMMUNITIES).await?;
    if !communities.is_empty() {
        write_records(ctx.output.as_ref(), tables::COMMUNITIES, &communities).await?;
    }

    ctx.stats.num_documents = documents.len();
    info!(
        documents = documents.len(),
        skipped = total - documents.len(),
        text_units = text_units.len(),
        communities = communities.len(),
        "Loaded input"
    );
    Ok(WorkflowOutput::with_result(json!({
        "documents": documents.len(),
        "text_units": text_units.len(),
    })))
}
