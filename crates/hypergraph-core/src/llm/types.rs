//! Completion request/response types
//!
//! Provider-neutral shapes that flow through the middleware pipeline. The
//! wire format of a specific provider lives next to that provider.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::create_cache_key;
use crate::error::Result;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message (instructions/context)
    System,
    /// User message
    User,
    /// Assistant message (model output)
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// A completion request as seen by the middleware pipeline
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionRequest {
    /// Model name; filled from the gateway's configuration when empty
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Explicit cache key; wins over the content hash
    pub cache_key: Option<String>,
    /// Operation label used for logging (e.g. `extract_graph`)
    pub operation: Option<String>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Single user-message request
    pub fn prompt(content: impl Into<String>) -> Self {
        Self::new(vec![Message::user(content)])
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Key under which this request's response is cached.
    ///
    /// Hashes model, messages and sampling parameters. The operation label
    /// is excluded so identical prompts share an entry.
    pub fn cache_key(&self) -> Result<String> {
        if let Some(key) = &self.cache_key {
            return Ok(key.clone());
        }
        let hash = create_cache_key(&json!({
            "model": self.model,
            "messages": self.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        }))?;
        Ok(format!("chat_{}", hash))
    }

    /// Rough token estimate (~4 characters per token) plus the output budget
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| m.content.len() + m.role.to_string().len() + 4)
            .sum();
        (chars / 4) as u64 + u64::from(self.max_tokens.unwrap_or(0))
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Reason the model stopped generating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Completion result returned through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text
    pub content: String,
    /// Model that produced the text
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub finish_reason: FinishReason,
    /// Served from cache rather than the provider
    #[serde(skip)]
    pub cached: bool,
}

impl CompletionResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            cached: false,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_override_wins() {
        let request = CompletionRequest::prompt("hello").with_cache_key("fixed");
        assert_eq!(request.cache_key().unwrap(), "fixed");
    }

    #[test]
    fn test_cache_key_covers_parameters_not_operation() {
        let base = CompletionRequest::prompt("hello").with_model("m");
        let key = base.cache_key().unwrap();
        assert!(key.starts_with("chat_"));

        assert_eq!(
            base.clone().with_operation("extract_graph").cache_key().unwrap(),
            key
        );
        assert_ne!(base.clone().with_temperature(0.7).cache_key().unwrap(), key);
        assert_ne!(base.with_model("other").cache_key().unwrap(), key);
    }

    #[test]
    fn test_usage_total_saturates() {
        assert_eq!(Usage::new(3, 4).total(), 7);
        assert_eq!(Usage::new(u32::MAX, 10).total(), u32::MAX);
    }

    #[test]
    fn test_estimated_tokens() {
        let request = CompletionRequest::prompt("a".repeat(400)).with_max_tokens(100);
        // 400 chars + "user" + 4 framing chars
        assert_eq!(request.estimated_tokens(), 102 + 100);
    }

    #[test]
    fn test_response_cached_flag_not_serialized() {
        let mut response = CompletionResponse::new("text", "m").with_usage(Usage::new(3, 4));
        response.cached = true;
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("cached").is_none());

        let back: CompletionResponse = serde_json::from_value(value).unwrap();
        assert!(!back.cached);
        assert_eq!(back.usage.total(), 7);
    }
}
