//! Completion providers
//!
//! A provider performs exactly one model call per `complete`. Caching, rate
//! limiting and retries are layered on top by the middleware pipeline, so
//! implementations only need to classify their failures as transient or
//! terminal.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::registry::Registry;

use super::openai::OpenAiCompatibleProvider;
use super::types::{CompletionRequest, CompletionResponse, Usage};

/// A model provider behind the completion gateway
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider discriminator, as used in configuration
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Constructor signature stored in the provider registry
pub type ProviderFactory = dyn Fn(&ModelConfig) -> Result<Arc<dyn CompletionProvider>> + Send + Sync;

/// Registry of completion providers keyed by `models.<id>.provider`
pub type ProviderRegistry = Registry<ProviderFactory>;

/// Registry pre-populated with `openai_compatible` and `mock`
pub fn default_providers() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new("completion provider");
    registry
        .register(
            "openai_compatible",
            Arc::new(|config: &ModelConfig| {
                Ok(Arc::new(OpenAiCompatibleProvider::from_config(config)?)
                    as Arc<dyn CompletionProvider>)
            }),
        )
        .register(
            "mock",
            Arc::new(|config: &ModelConfig| {
                Ok(Arc::new(
                    MockProvider::new(config.mock_responses.clone()).with_model(&config.model),
                ) as Arc<dyn CompletionProvider>)
            }),
        );
    registry
}

/// Callback deciding what a [`MockProvider`] returns for call number `n`
pub type MockResponder = dyn Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync;

/// Scripted provider for tests and offline runs
pub struct MockProvider {
    model: String,
    responder: Arc<MockResponder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("model", &self.model)
            .field("calls", &self.calls())
            .finish()
    }
}

impl MockProvider {
    /// Cycle through `responses` in order (empty string when none given)
    pub fn new(responses: Vec<String>) -> Self {
        Self::with_responder(move |_, call| {
            Ok(if responses.is_empty() {
                String::new()
            } else {
                responses[call % responses.len()].clone()
            })
        })
    }

    /// Compute each response with a callback receiving the zero-based call index
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            model: "mock".to_string(),
            responder: Arc::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Simulated latency for every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls that reached the provider
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let content = (self.responder)(request, call)?;
        debug!(call, chars = content.len(), "Mock completion");

        let prompt_tokens = request.estimated_tokens()
            - u64::from(request.max_tokens.unwrap_or(0));
        let usage = Usage::new(
            u32::try_from(prompt_tokens).unwrap_or(u32::MAX),
            u32::try_from(content.len() / 4).unwrap_or(u32::MAX),
        );
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };
        Ok(CompletionResponse::new(content, model).with_usage(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransientKind};

    fn failing_responder(
        make_error: impl Fn() -> Error + Send + Sync + 'static,
    ) -> impl Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync + 'static {
        move |_, _| Err(make_error())
    }

    #[tokio::test]
    async fn test_mock_cycles_responses() {
        let provider = MockProvider::new(vec!["a".into(), "b".into()]);
        let request = CompletionRequest::prompt("hi");

        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(provider.complete(&request).await.unwrap().content);
        }
        assert_eq!(out, vec!["a", "b", "a"]);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_responder_sees_call_index() {
        let provider = MockProvider::with_responder(|_, call| {
            if call == 0 {
                Err(Error::transient(TransientKind::Timeout, "first call"))
            } else {
                Ok("ok".to_string())
            }
        });
        let request = CompletionRequest::prompt("hi");

        assert!(provider.complete(&request).await.unwrap_err().is_transient());
        assert_eq!(provider.complete(&request).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_failing_responder() {
        let provider = MockProvider::with_responder(failing_responder(|| {
            Error::TerminalProvider("nope".into())
        }));
        let err = provider
            .complete(&CompletionRequest::prompt("x"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_default_providers_registered() {
        let registry = default_providers();
        assert_eq!(registry.names(), vec!["mock", "openai_compatible"]);

        let config = ModelConfig {
            provider: "mock".into(),
            model: "mock-model".into(),
            ..ModelConfig::default()
        };
        let provider = registry.get("mock").unwrap()(&config).unwrap();
        assert_eq!(provider.name(), "mock");
    }
}
