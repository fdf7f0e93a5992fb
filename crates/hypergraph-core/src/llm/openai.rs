//! OpenAI-compatible chat completions provider
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol.
//! This provider makes one HTTP call per request; failures are classified so
//! the retry middleware can decide what to do with them:
//! - 408, 429, 5xx, timeouts and connection failures are transient
//! - every other non-success status is terminal

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{Error, Result, TransientKind};

use super::provider::CompletionProvider;
use super::types::{CompletionRequest, CompletionResponse, FinishReason, Message, Usage};

/// Default API base when none is configured
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Request body for chat completions
#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: Message,
    finish_reason: Option<FinishReason>,
}

/// Response from the chat completions API
#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

/// HTTP provider for OpenAI-compatible endpoints
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    http_client: HttpClient,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Builder for [`OpenAiCompatibleProvider`]
#[derive(Default)]
pub struct OpenAiCompatibleProviderBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

impl OpenAiCompatibleProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<OpenAiCompatibleProvider> {
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::ConfigError("model name is required".to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(self.timeout_secs.unwrap_or(180)))
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(OpenAiCompatibleProvider {
            http_client,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: self.api_key,
            model,
        })
    }
}

impl OpenAiCompatibleProvider {
    pub fn builder() -> OpenAiCompatibleProviderBuilder {
        OpenAiCompatibleProviderBuilder::new()
    }

    /// Build from a model configuration, reading the key from the environment
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .model(&config.model)
            .timeout_secs(config.timeout_secs);
        if let Some(base) = &config.api_base {
            builder = builder.base_url(base);
        }
        if let Some(key) = config.resolved_api_key() {
            builder = builder.api_key(key);
        }
        builder.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = if request.model.is_empty() {
            &self.model
        } else {
            &request.model
        };

        debug!(
            model = %model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let body = ChatRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http_request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::TerminalProvider(format!("Failed to parse response: {}", e)))?;

        let usage = chat
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::TerminalProvider("Empty response from API".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content,
            model: chat.model,
            usage,
            finish_reason: choice.finish_reason.unwrap_or_default(),
            cached: false,
        })
    }
}

fn classify_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::transient(TransientKind::Timeout, err.to_string())
    } else if err.is_connect() || err.is_request() {
        Error::transient(TransientKind::Connection, err.to_string())
    } else {
        Error::TerminalProvider(err.to_string())
    }
}

/// Map a non-success HTTP status to a transient or terminal error
fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> Error {
    match status {
        408 => Error::transient(TransientKind::Timeout, body),
        429 => Error::transient(
            TransientKind::RateLimited {
                retry_after_secs: retry_after,
            },
            body,
        ),
        500..=599 => Error::transient(TransientKind::ServerError { status }, body),
        401 => Error::TerminalProvider(
            "Unauthorized: check the environment variable named by api_key_env".to_string(),
        ),
        400 => Error::TerminalProvider(format!("Bad request: {}", body)),
        404 => Error::TerminalProvider(format!("Model not found or endpoint unavailable: {}", body)),
        _ => Error::TerminalProvider(format!("HTTP error {}: {}", status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_model() {
        assert!(OpenAiCompatibleProvider::builder().build().is_err());
    }

    #[test]
    fn test_builder_trims_base_url() {
        let provider = OpenAiCompatibleProvider::builder()
            .model("gpt-4o-mini")
            .base_url("http://localhost:8080/v1/")
            .build()
            .unwrap();
        assert_eq!(provider.base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn test_debug_redacts_key() {
        let provider = OpenAiCompatibleProvider::builder()
            .model("m")
            .api_key("sk-secret")
            .build()
            .unwrap();
        let rendered = format!("{:?}", provider);
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(429, Some(3), "").is_transient());
        assert!(classify_status(503, None, "").is_transient());
        assert!(classify_status(408, None, "").is_transient());
        assert!(!classify_status(400, None, "").is_transient());
        assert!(!classify_status(401, None, "").is_transient());

        match classify_status(429, Some(7), "slow down") {
            Error::TransientProvider {
                kind: TransientKind::RateLimited { retry_after_secs },
                ..
            } => assert_eq!(retry_after_secs, Some(7)),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_chat_response_parsing() {
        let raw = r#"{
            "id": "x", "object": "chat.completion", "created": 0, "model": "gpt",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        assert_eq!(parsed.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 5);
    }
}
