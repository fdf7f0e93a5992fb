//! Description summarization

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::graph::{Entity, Relationship};
use crate::index::prompts::render;
use crate::llm::{CompletionRequest, LlmCompletion};

/// Rough token count used to budget prompt input
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Keep leading descriptions while they fit in `max_input_tokens`.
///
/// The first description is always kept.
pub fn fit_descriptions(descriptions: &[String], max_input_tokens: usize) -> Vec<String> {
    let mut used = 0;
    let mut kept = Vec::new();
    for description in descriptions {
        let tokens = estimate_tokens(description);
        if !kept.is_empty() && used + tokens > max_input_tokens {
            break;
        }
        used += tokens;
        kept.push(description.clone());
    }
    kept
}

/// Collapses multi-description records into one summary each
#[derive(Debug, Clone)]
pub struct DescriptionSummarizer<'a> {
    pub gateway: &'a LlmCompletion,
    pub prompt: &'a str,
    pub max_length: usize,
    pub max_input_tokens: usize,
    pub concurrency: usize,
}

impl DescriptionSummarizer<'_> {
    async fn summarize(
        &self,
        name: String,
        descriptions: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let fitted = fit_descriptions(&descriptions, self.max_input_tokens);
        let description_list = serde_json::to_string(&fitted)?;
        let max_length = self.max_length.to_string();
        let prompt = render(
            self.prompt,
            &[
                ("max_length", max_length.as_str()),
                ("entity_name", name.as_str()),
                ("description_list", description_list.as_str()),
            ],
        );
        let response = self
            .gateway
            .complete(
                CompletionRequest::prompt(prompt).with_operation("summarize_descriptions"),
                cancel,
            )
            .await?;
        Ok(response.content.trim().to_string())
    }

    async fn summarize_all(
        &self,
        jobs: Vec<(usize, String, Vec<String>)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, String)>> {
        stream::iter(jobs)
            .map(|(position, name, descriptions)| async move {
                let summary = self.summarize(name, descriptions, cancel).await?;
                Ok::<_, crate::error::Error>((position, summary))
            })
            .buffered(self.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Replace every list of two or more descriptions with a single summary
    pub async fn run(
        &self,
        entities: &mut [Entity],
        relationships: &mut [Relationship],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let entity_jobs: Vec<_> = entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.description.len() > 1)
            .map(|(i, e)| (i, e.title.clone(), e.description.clone()))
            .collect();
        let relationship_jobs: Vec<_> = relationships
            .iter()
            .enumerate()
            .filter(|(_, r)| r.description.len() > 1)
            .map(|(i, r)| {
                let name = serde_json::json!([r.source, r.target]).to_string();
                (i, name, r.description.clone())
            })
            .collect();

        info!(
            entities = entity_jobs.len(),
            relationships = relationship_jobs.len(),
            "Summarizing descriptions"
        );

        for (position, summary) in self.summarize_all(entity_jobs, cancel).await? {
            entities[position].description = vec![summary];
        }
        for (position, summary) in self.summarize_all(relationship_jobs, cancel).await? {
            relationships[position].description = vec![summary];
        }
        Ok(())
    }
}
