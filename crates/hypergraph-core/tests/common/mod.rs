//! Shared fixtures for the indexing integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use hypergraph_core::config::{Config, DEFAULT_COMPLETION_MODEL_ID, ModelConfig};
use hypergraph_core::graph::{Document, JsonlTableProvider, read_records_or_empty, tables, write_records};
use hypergraph_core::llm::{
    CompletionProvider, CompletionRequest, MockProvider, Registries,
};
use hypergraph_core::{Error, Result};

pub const ALICE_TEXT: &str = "Alice works at Acme.";
pub const BOB_TEXT: &str = "Bob works at Acme.";

const ALICE_RECORDS: &str = r#"("entity"<|>Alice<|>person<|>An engineer)
##
("entity"<|>Acme<|>organization<|>A company)
##
("relationship"<|>Alice<|>Acme<|>works at: Alice is employed by Acme<|>5)
<|COMPLETE|>"#;

const BOB_RECORDS: &str = r#"("entity"<|>Bob<|>person<|>A designer)
##
("entity"<|>Acme<|>organization<|>A manufacturer)
##
("relationship"<|>Bob<|>Acme<|>works at: Bob is employed by Acme<|>3)
<|COMPLETE|>"#;

const CLAIM_RECORDS: &str =
    "(ALICE<|>ACME<|>EMPLOYMENT<|>TRUE<|>2020-01-01<|>NONE<|>Alice works at Acme<|>Alice works at Acme.)<|COMPLETE|>";

pub const SUMMARY: &str = "A merged summary";

/// Answers by looking at the last message of each request
pub fn respond(request: &CompletionRequest, _call: usize) -> Result<String> {
    if request.operation.as_deref() == Some("summarize_descriptions") {
        return Ok(SUMMARY.to_string());
    }
    let prompt = request
        .messages
        .last()
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    if request.operation.as_deref() == Some("extract_claims") {
        return Ok(if prompt.contains(ALICE_TEXT) {
            CLAIM_RECORDS.to_string()
        } else {
            String::new()
        });
    }
    Ok(if prompt.contains(ALICE_TEXT) {
        ALICE_RECORDS.to_string()
    } else if prompt.contains(BOB_TEXT) {
        BOB_RECORDS.to_string()
    } else {
        String::new()
    })
}

/// Default registries plus a `scripted` provider backed by `responder`
pub fn registries_with<F>(responder: F) -> Registries
where
    F: Fn(&CompletionRequest, usize) -> Result<String> + Clone + Send + Sync + 'static,
{
    let mut registries = Registries::default();
    registries.providers.register(
        "scripted",
        Arc::new(move |_: &ModelConfig| -> Result<Arc<dyn CompletionProvider>> {
            Ok(Arc::new(MockProvider::with_responder(responder.clone())))
        }),
    );
    registries
}

pub fn scripted_registries() -> Registries {
    registries_with(respond)
}

/// Responder that rejects every call
pub fn failing(_: &CompletionRequest, _: usize) -> Result<String> {
    Err(Error::TerminalProvider("model unavailable".to_string()))
}

/// Configuration rooted at `root` using the `scripted` provider
pub fn test_config(root: &Path) -> Config {
    let mut config = Config {
        root_dir: root.to_path_buf(),
        ..Config::default()
    };
    config.input_storage.base_dir = root.join("input");
    config.output_storage.base_dir = root.join("output");
    config.update_output_storage.base_dir = root.join("update_output");
    config.reporting.base_dir = root.join("logs");
    config.cache.backend = "memory".to_string();

    let model = ModelConfig {
        provider: "scripted".to_string(),
        model: "scripted-model".to_string(),
        api_key_env: None,
        ..ModelConfig::default()
    };
    config
        .models
        .insert(DEFAULT_COMPLETION_MODEL_ID.to_string(), model);
    config
}

pub fn document(id: &str, text: &str) -> Document {
    Document {
        id: id.to_string(),
        human_readable_id: 0,
        title: format!("{}.txt", id),
        text: text.to_string(),
        text_unit_ids: Vec::new(),
    }
}

pub async fn write_input(config: &Config, documents: &[Document]) {
    let input = JsonlTableProvider::new(&config.input_storage.base_dir);
    write_records(&input, tables::DOCUMENTS, documents).await.unwrap();
}

pub fn output_store(config: &Config) -> JsonlTableProvider {
    JsonlTableProvider::new(&config.output_storage.base_dir)
}

pub async fn read_output<T: serde::de::DeserializeOwned>(config: &Config, table: &str) -> Vec<T> {
    read_records_or_empty(&output_store(config), table).await.unwrap()
}
