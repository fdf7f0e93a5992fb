//! Claim extraction

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{Covariate, TextUnit};
use crate::index::parse::{ExtractedClaim, parse_claim_records};
use crate::llm::LlmCompletion;

use super::extract::gleaned_completion;

fn to_covariate(claim: ExtractedClaim, text_unit_id: &str) -> Covariate {
    Covariate {
        id: Uuid::new_v4().to_string(),
        human_readable_id: 0,
        covariate_type: "claim".to_string(),
        claim_type: Some(claim.claim_type),
        description: Some(claim.description),
        subject_id: claim.subject,
        object_id: claim.object,
        status: Some(claim.status),
        start_date: claim.start_date,
        end_date: claim.end_date,
        source_text: Some(claim.source_text),
        text_unit_id: text_unit_id.to_string(),
    }
}

/// Settings for one claim extraction pass
#[derive(Debug, Clone)]
pub struct ClaimExtraction<'a> {
    pub gateway: &'a LlmCompletion,
    /// Rendered template with `{input_text}` still in place
    pub prompt: &'a str,
    pub max_gleanings: u32,
    pub concurrency: usize,
}

impl ClaimExtraction<'_> {
    /// Claims for every text unit, in input order, numbered densely
    pub async fn run(&self, text_units: &[TextUnit], cancel: &CancellationToken) -> Result<Vec<Covariate>> {
        let per_unit: Vec<Vec<Covariate>> = stream::iter(text_units)
            .map(|unit| async move {
                let prompt = self.prompt.replace("{input_text}", &unit.text);
                let output =
                    gleaned_completion(self.gateway, prompt, self.max_gleanings, "extract_claims", cancel)
                        .await?;
                let claims = parse_claim_records(&output)
                    .into_iter()
                    .map(|claim| to_covariate(claim, &unit.id))
                    .collect::<Vec<_>>();
                Ok::<_, crate::error::Error>(claims)
            })
            .buffered(self.concurrency.max(1))
            .boxed()
            .try_collect()
            .await?;

        let mut covariates: Vec<Covariate> = per_unit.into_iter().flatten().collect();
        for (index, covariate) in covariates.iter_mut().enumerate() {
            covariate.human_readable_id = index as u64;
        }
        info!(claims = covariates.len(), "Extracted claims");
        Ok(covariates)
    }
}
