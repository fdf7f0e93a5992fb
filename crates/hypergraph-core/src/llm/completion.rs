//! Completion gateway
//!
//! [`LlmCompletion`] is the single call surface workflows use. It owns a
//! middleware pipeline built once from a [`ModelConfig`]; the
//! [`CompletionFactory`] builds gateways and hands out one per model
//! instance name so rate limits are shared by every caller of that instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::Cache;
use crate::config::{Config, ModelConfig};
use crate::error::{Error, Result};

use super::metrics::MetricsStore;
use super::middleware::{
    CacheMiddleware, CompletionHandler, FailureInjectionMiddleware, LoggingMiddleware,
    MetricsMiddleware, MiddlewarePipeline, RateLimitMiddleware, RetryMiddleware, provider_handler,
};
use super::provider::{CompletionProvider, ProviderRegistry, default_providers};
use super::rate_limit::{RateLimiter, RateLimiterRegistry, default_rate_limiters};
use super::retry::{Retrier, RetryRegistry, default_retry_strategies};
use super::types::{CompletionRequest, CompletionResponse};

/// Strategy registries consulted when building gateways
#[derive(Clone)]
pub struct Registries {
    pub providers: ProviderRegistry,
    pub rate_limiters: RateLimiterRegistry,
    pub retries: RetryRegistry,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            rate_limiters: default_rate_limiters(),
            retries: default_retry_strategies(),
        }
    }
}

/// Uniform completion surface over a decorated provider
#[derive(Clone)]
pub struct LlmCompletion {
    instance_name: String,
    config: ModelConfig,
    handler: CompletionHandler,
    limiter: Arc<dyn RateLimiter>,
    layers: Vec<&'static str>,
}

impl std::fmt::Debug for LlmCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCompletion")
            .field("instance_name", &self.instance_name)
            .field("model", &self.config.model)
            .field("layers", &self.layers)
            .finish()
    }
}

impl LlmCompletion {
    /// Complete `request`, filling model parameters from configuration
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        if request.model.is_empty() {
            request.model = self.config.model.clone();
        }
        if request.temperature.is_none() {
            request.temperature = Some(self.config.temperature);
        }
        if request.max_tokens.is_none() {
            request.max_tokens = self.config.max_tokens;
        }
        (self.handler)(request, cancel.clone()).await
    }

    /// Cache partition / limiter identity of this gateway
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    /// Middleware names, outermost first
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    /// Permits currently held against this instance's limiter
    pub fn in_flight(&self) -> usize {
        self.limiter.in_flight()
    }
}

/// Build a gateway for one model instance.
///
/// Layers, outermost first: logging, metrics (when enabled), cache, rate
/// limit, retry, failure injection (when `failure_rate > 0`), provider.
pub fn create_completion(
    instance_name: &str,
    config: &ModelConfig,
    provider: Arc<dyn CompletionProvider>,
    cache: &Cache,
    metrics: &MetricsStore,
    registries: &Registries,
) -> Result<LlmCompletion> {
    let limiter = registries.rate_limiters.get(&config.rate_limit.strategy)?(
        instance_name,
        &config.rate_limit,
    )?;
    let retrier = Retrier::from_config(&config.retry, &registries.retries)?;

    let mut pipeline = MiddlewarePipeline::new().with(LoggingMiddleware::new(instance_name));
    if config.metrics {
        pipeline = pipeline.with(MetricsMiddleware::new(instance_name, metrics.clone()));
    }
    let acquire_timeout = Some(Duration::from_secs(config.rate_limit.acquire_timeout_secs));
    pipeline = pipeline
        .with(CacheMiddleware::new(cache.child(instance_name)))
        .with(RateLimitMiddleware::new(Arc::clone(&limiter), acquire_timeout));
    let mut retry =
        RetryMiddleware::new(retrier).with_rate_limiter(Arc::clone(&limiter), acquire_timeout);
    if config.metrics {
        retry = retry.with_metrics(instance_name, metrics.clone());
    }
    pipeline = pipeline.with(retry);
    if config.failure_rate > 0.0 {
        pipeline = pipeline.with(FailureInjectionMiddleware::new(config.failure_rate));
    }

    let layers = pipeline.names();
    let handler = pipeline.build(provider_handler(provider));

    info!(
        instance = %instance_name,
        model = %config.model,
        provider = %config.provider,
        layers = ?layers,
        "Completion gateway ready"
    );

    Ok(LlmCompletion {
        instance_name: instance_name.to_string(),
        config: config.clone(),
        handler,
        limiter,
        layers,
    })
}

/// Builds and memoizes gateways for a run
pub struct CompletionFactory {
    config: Arc<Config>,
    cache: Cache,
    metrics: MetricsStore,
    registries: Registries,
    /// Gateways by instance name, with the model id each was built for
    gateways: Mutex<HashMap<String, (String, LlmCompletion)>>,
}

impl std::fmt::Debug for CompletionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionFactory")
            .field("cache", &self.cache)
            .finish()
    }
}

impl CompletionFactory {
    pub fn new(
        config: Arc<Config>,
        cache: Cache,
        metrics: MetricsStore,
        registries: Registries,
    ) -> Self {
        Self {
            config,
            cache,
            metrics,
            registries,
            gateways: Mutex::new(HashMap::new()),
        }
    }

    /// Gateway for `instance_name` using model `model_id`; built on first use.
    ///
    /// An instance name belongs to one model: asking for it with another
    /// model id is a configuration error.
    pub fn get(&self, model_id: &str, instance_name: &str) -> Result<LlmCompletion> {
        let mut gateways = self
            .gateways
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((built_for, existing)) = gateways.get(instance_name) {
            if built_for != model_id {
                return Err(Error::ConfigError(format!(
                    "model instance '{}' is used with both '{}' and '{}'; give each model its own model_instance_name",
                    instance_name, built_for, model_id
                )));
            }
            return Ok(existing.clone());
        }

        let model_config = self.config.completion_model(model_id)?;
        let provider = self.registries.providers.get(&model_config.provider)?(model_config)?;
        let gateway = create_completion(
            instance_name,
            model_config,
            provider,
            &self.cache,
            &self.metrics,
            &self.registries,
        )?;
        gateways.insert(
            instance_name.to_string(),
            (model_id.to_string(), gateway.clone()),
        );
        Ok(gateway)
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::TransientKind;
    use crate::llm::provider::MockProvider;

    fn mock_config() -> ModelConfig {
        ModelConfig {
            provider: "mock".into(),
            model: "mock-model".into(),
            retry: RetryConfig {
                strategy: "immediate".into(),
                max_attempts: 3,
                ..RetryConfig::default()
            },
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_layer_order() {
        let gateway = create_completion(
            "extract_graph",
            &mock_config(),
            Arc::new(MockProvider::new(vec![])),
            &Cache::memory(),
            &MetricsStore::default(),
            &Registries::default(),
        )
        .unwrap();
        assert_eq!(
            gateway.layers(),
            &["logging", "metrics", "cache", "rate_limit", "retry"]
        );
    }

    #[tokio::test]
    async fn test_warm_cache_skips_provider() {
        let provider = Arc::new(MockProvider::new(vec!["hello".into()]));
        let metrics = MetricsStore::default();
        let gateway = create_completion(
            "extract_graph",
            &mock_config(),
            provider.clone(),
            &Cache::memory(),
            &metrics,
            &Registries::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let cold = gateway.complete(CompletionRequest::prompt("q"), &cancel).await.unwrap();
        let warm = gateway.complete(CompletionRequest::prompt("q"), &cancel).await.unwrap();

        assert_eq!(cold.content, warm.content);
        assert!(warm.cached);
        assert_eq!(provider.calls(), 1);
        let m = metrics.get("extract_graph").unwrap();
        assert_eq!(m.requests, 2);
        assert_eq!(m.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_and_release_permits() {
        let provider = Arc::new(MockProvider::with_responder(|_, _| {
            Err(Error::transient(TransientKind::Timeout, "slow"))
        }));
        let gateway = create_completion(
            "x",
            &mock_config(),
            provider.clone(),
            &Cache::memory(),
            &MetricsStore::default(),
            &Registries::default(),
        )
        .unwrap();

        let err = gateway
            .complete(CompletionRequest::prompt("q"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExhaustedRetries { attempts: 3, .. }));
        assert_eq!(provider.calls(), 3);
        assert_eq!(gateway.in_flight(), 0);
    }

    #[test]
    fn test_factory_memoizes_per_instance() {
        let mut config = Config::default();
        config.models.insert("mock".into(), mock_config());
        let factory = CompletionFactory::new(
            Arc::new(config),
            Cache::memory(),
            MetricsStore::default(),
            Registries::default(),
        );

        let a = factory.get("mock", "extract_graph").unwrap();
        let b = factory.get("mock", "extract_graph").unwrap();
        assert!(Arc::ptr_eq(&a.limiter, &b.limiter));
        assert!(factory.get("missing", "other").is_err());
    }

    #[tokio::test]
    async fn test_instance_name_bound_to_one_model() {
        let mut config = Config::default();
        config.models.insert(
            "a".into(),
            ModelConfig {
                mock_responses: vec!["A".into()],
                ..mock_config()
            },
        );
        config.models.insert(
            "b".into(),
            ModelConfig {
                mock_responses: vec!["B".into()],
                ..mock_config()
            },
        );
        let factory = CompletionFactory::new(
            Arc::new(config),
            Cache::memory(),
            MetricsStore::default(),
            Registries::default(),
        );

        let a = factory.get("a", "shared").unwrap();
        let answer = a
            .complete(CompletionRequest::prompt("q"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.content, "A");

        assert!(matches!(factory.get("b", "shared"), Err(Error::ConfigError(_))));
        let b = factory.get("b", "b_only").unwrap();
        let answer = b
            .complete(CompletionRequest::prompt("q"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.content, "B");
    }

    #[test]
    fn test_unknown_provider_strategy() {
        let mut config = Config::default();
        config.models.insert(
            "weird".into(),
            ModelConfig {
                provider: "carrier_pigeon".into(),
                ..mock_config()
            },
        );
        let factory = CompletionFactory::new(
            Arc::new(config),
            Cache::memory(),
            MetricsStore::default(),
            Registries::default(),
        );
        assert!(matches!(
            factory.get("weird", "x"),
            Err(Error::UnknownStrategy { .. })
        ));
    }
}
