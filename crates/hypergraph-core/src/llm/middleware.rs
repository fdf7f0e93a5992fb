//! Completion middleware
//!
//! Every middleware is a `(next) -> next'` wrapper over one handler
//! signature. A [`MiddlewarePipeline`] folds its layers around a terminal
//! provider handler once, at construction; the first layer pushed is the
//! outermost. The gateway uses this order:
//!
//! ```text
//! logging -> metrics -> cache -> rate limit -> retry -> [failure injection] -> provider
//! ```
//!
//! so a cache hit never touches the limiter or the retrier. A concurrency
//! permit is held across all retry attempts of one request, while every
//! attempt after the first is charged against the request and token
//! budgets again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::{Error, Result, TransientKind};

use super::metrics::MetricsStore;
use super::provider::CompletionProvider;
use super::rate_limit::RateLimiter;
use super::retry::Retrier;
use super::types::{CompletionRequest, CompletionResponse};

/// Future returned by every handler
pub type CompletionFuture = BoxFuture<'static, Result<CompletionResponse>>;

/// The one handler signature all middleware share
pub type CompletionHandler =
    Arc<dyn Fn(CompletionRequest, CancellationToken) -> CompletionFuture + Send + Sync>;

/// A `(next) -> next'` wrapper
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler;
}

/// Ordered list of middleware, outermost first
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer inside the ones already present
    pub fn with(mut self, layer: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Wrap `terminal` in every layer
    pub fn build(&self, terminal: CompletionHandler) -> CompletionHandler {
        self.layers
            .iter()
            .rev()
            .fold(terminal, |next, layer| layer.wrap(next))
    }
}

/// Box a closure as a [`CompletionHandler`]
pub fn handler_fn<F>(f: F) -> CompletionHandler
where
    F: Fn(CompletionRequest, CancellationToken) -> CompletionFuture + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Terminal handler calling the provider; aborts on cancellation
pub fn provider_handler(provider: Arc<dyn CompletionProvider>) -> CompletionHandler {
    handler_fn(move |request, cancel| {
        let provider = Arc::clone(&provider);
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = provider.complete(&request) => result,
            }
        })
    })
}

/// Structured request/response logging
pub struct LoggingMiddleware {
    instance: Arc<str>,
}

impl LoggingMiddleware {
    pub fn new(instance: &str) -> Self {
        Self {
            instance: Arc::from(instance),
        }
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let instance = Arc::clone(&self.instance);
        handler_fn(move |request, cancel| {
            let next = Arc::clone(&next);
            let instance = Arc::clone(&instance);
            Box::pin(async move {
                let started = Instant::now();
                let operation = request.operation.clone().unwrap_or_default();
                debug!(instance = %instance, operation = %operation, messages = request.messages.len(), "Completion requested");

                let result = next(request, cancel).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(response) => debug!(
                        instance = %instance,
                        operation = %operation,
                        cached = response.cached,
                        tokens = response.usage.total(),
                        elapsed_ms,
                        "Completion finished"
                    ),
                    Err(err) => warn!(
                        instance = %instance,
                        operation = %operation,
                        code = err.code(),
                        error = %err,
                        elapsed_ms,
                        "Completion failed"
                    ),
                }
                result
            })
        })
    }
}

/// Counts requests, cache hits, failures, tokens, latency and cost
pub struct MetricsMiddleware {
    instance: Arc<str>,
    store: MetricsStore,
}

impl MetricsMiddleware {
    pub fn new(instance: &str, store: MetricsStore) -> Self {
        Self {
            instance: Arc::from(instance),
            store,
        }
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let instance = Arc::clone(&self.instance);
        let store = self.store.clone();
        handler_fn(move |request, cancel| {
            let next = Arc::clone(&next);
            let instance = Arc::clone(&instance);
            let store = store.clone();
            Box::pin(async move {
                store.record_request(&instance);
                let started = Instant::now();
                let result = next(request, cancel).await;
                match &result {
                    Ok(response) if response.cached => store.record_cache_hit(&instance),
                    Ok(response) => store.record_success(
                        &instance,
                        &response.model,
                        &response.usage,
                        started.elapsed(),
                    ),
                    Err(_) => store.record_failure(&instance),
                }
                result
            })
        })
    }
}

/// Serves repeated requests from the cache; stores fresh responses
pub struct CacheMiddleware {
    cache: Cache,
}

impl CacheMiddleware {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let cache = self.cache.clone();
        handler_fn(move |request, cancel| {
            let next = Arc::clone(&next);
            let cache = cache.clone();
            Box::pin(async move {
                let key = request.cache_key()?;

                match cache.get_as::<CompletionResponse>(&key).await {
                    Ok(Some(mut hit)) => {
                        hit.cached = true;
                        return Ok(hit);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(namespace = %cache.namespace(), error = %err, "Cache lookup failed, calling provider");
                    }
                }

                let response = next(request, cancel).await?;
                if let Err(err) = cache.set(&key, &response).await {
                    warn!(namespace = %cache.namespace(), error = %err, "Failed to store completion in cache");
                }
                Ok(response)
            })
        })
    }
}

/// Holds a limiter permit for the duration of the inner call
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    acquire_timeout: Option<Duration>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>, acquire_timeout: Option<Duration>) -> Self {
        Self {
            limiter,
            acquire_timeout,
        }
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let limiter = Arc::clone(&self.limiter);
        let acquire_timeout = self.acquire_timeout;
        handler_fn(move |request, cancel| {
            let next = Arc::clone(&next);
            let limiter = Arc::clone(&limiter);
            Box::pin(async move {
                let deadline = acquire_timeout.map(|t| tokio::time::Instant::now() + t);
                let permit = limiter
                    .acquire(request.estimated_tokens(), deadline, &cancel)
                    .await?;
                let result = next(request, cancel).await;
                permit.release();
                result
            })
        })
    }
}

/// Retries transient failures of the inner handler
pub struct RetryMiddleware {
    retrier: Retrier,
    metrics: Option<(Arc<str>, MetricsStore)>,
    budget: Option<(Arc<dyn RateLimiter>, Option<Duration>)>,
}

impl RetryMiddleware {
    pub fn new(retrier: Retrier) -> Self {
        Self {
            retrier,
            metrics: None,
            budget: None,
        }
    }

    /// Charge every retry attempt against `limiter`'s budgets
    pub fn with_rate_limiter(
        mut self,
        limiter: Arc<dyn RateLimiter>,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        self.budget = Some((limiter, acquire_timeout));
        self
    }

    /// Count retries and provider calls under `instance`
    pub fn with_metrics(mut self, instance: &str, store: MetricsStore) -> Self {
        self.metrics = Some((Arc::from(instance), store));
        self
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let retrier = self.retrier.clone();
        let metrics = self.metrics.clone();
        let budget = self.budget.clone();
        handler_fn(move |request, cancel| {
            let next = Arc::clone(&next);
            let retrier = retrier.clone();
            let metrics = metrics.clone();
            let budget = budget.clone();
            Box::pin(async move {
                let estimated_tokens = request.estimated_tokens();
                retrier
                    .run_with_observer(
                        &cancel,
                        |attempt| {
                            let next = Arc::clone(&next);
                            let metrics = metrics.clone();
                            let budget = budget.clone();
                            let request = request.clone();
                            let cancel = cancel.clone();
                            async move {
                                // The first attempt was charged when the permit was acquired
                                if let Some((limiter, timeout)) = budget.filter(|_| attempt > 1) {
                                    let deadline =
                                        timeout.map(|t| tokio::time::Instant::now() + t);
                                    limiter.charge(estimated_tokens, deadline, &cancel).await?;
                                }
                                if let Some((instance, store)) = &metrics {
                                    store.record_provider_call(instance);
                                }
                                next(request, cancel).await
                            }
                        },
                        |_, _| {
                            if let Some((instance, store)) = &metrics {
                                store.record_retry(instance);
                            }
                        },
                    )
                    .await
            })
        })
    }
}

/// Raises transient errors at a configured rate (testing aid)
pub struct FailureInjectionMiddleware {
    failure_rate: f64,
}

impl FailureInjectionMiddleware {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Middleware for FailureInjectionMiddleware {
    fn name(&self) -> &'static str {
        "failure_injection"
    }

    fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
        let failure_rate = self.failure_rate;
        handler_fn(move |request, cancel| {
            if failure_rate > 0.0 && rand::random::<f64>() < failure_rate {
                return Box::pin(async {
                    Err(Error::transient(
                        TransientKind::ServerError { status: 503 },
                        "injected failure",
                    ))
                });
            }
            next(request, cancel)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::MockProvider;
    use crate::llm::rate_limit::{QuotaRateLimiter, UnboundedRateLimiter};
    use crate::llm::retry::ImmediateBackoff;
    use crate::config::RateLimitConfig;
    use std::sync::Mutex;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recording {
        fn name(&self) -> &'static str {
            self.label
        }

        fn wrap(&self, next: CompletionHandler) -> CompletionHandler {
            let label = self.label;
            let log = Arc::clone(&self.log);
            handler_fn(move |request, cancel| {
                let next = Arc::clone(&next);
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().unwrap().push(format!("enter {label}"));
                    let result = next(request, cancel).await;
                    log.lock().unwrap().push(format!("exit {label}"));
                    result
                })
            })
        }
    }

    #[tokio::test]
    async fn test_first_layer_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .with(Recording { label: "outer", log: Arc::clone(&log) })
            .with(Recording { label: "inner", log: Arc::clone(&log) });
        assert_eq!(pipeline.names(), vec!["outer", "inner"]);

        let handler = pipeline.build(provider_handler(Arc::new(MockProvider::new(vec!["x".into()]))));
        handler(CompletionRequest::prompt("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter outer", "enter inner", "exit inner", "exit outer"]
        );
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_rate_limit() {
        let provider = Arc::new(MockProvider::new(vec!["answer".into()]));
        let limiter = Arc::new(
            QuotaRateLimiter::new(
                "test",
                &RateLimitConfig {
                    max_concurrent: 1,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap(),
        );
        let handler = MiddlewarePipeline::new()
            .with(CacheMiddleware::new(Cache::memory()))
            .with(RateLimitMiddleware::new(
                limiter.clone(),
                Some(Duration::from_millis(20)),
            ))
            .build(provider_handler(provider.clone()));

        let cancel = CancellationToken::new();
        let first = handler(CompletionRequest::prompt("q"), cancel.clone()).await.unwrap();
        assert!(!first.cached);

        // Saturate the limiter: a miss would now time out
        let _held = limiter.acquire(1, None, &cancel).await.unwrap();
        let second = handler(CompletionRequest::prompt("q"), cancel.clone()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.content, "answer");
        assert_eq!(provider.calls(), 1);

        let miss = handler(CompletionRequest::prompt("other"), cancel).await;
        assert!(matches!(miss, Err(Error::RateLimitTimeout { .. })));
    }

    #[tokio::test]
    async fn test_retry_inside_rate_limit_releases_permit() {
        let provider = Arc::new(MockProvider::with_responder(|_, call| {
            if call < 2 {
                Err(Error::transient(TransientKind::ServerError { status: 502 }, "bad gateway"))
            } else {
                Ok("done".to_string())
            }
        }));
        let limiter = Arc::new(
            QuotaRateLimiter::new("test", &RateLimitConfig::default()).unwrap(),
        );
        let store = MetricsStore::default();
        let handler = MiddlewarePipeline::new()
            .with(RateLimitMiddleware::new(limiter.clone(), None))
            .with(
                RetryMiddleware::new(Retrier::new(5, Arc::new(ImmediateBackoff)))
                    .with_metrics("test", store.clone()),
            )
            .build(provider_handler(provider.clone()));

        let response = handler(CompletionRequest::prompt("q"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.content, "done");
        assert_eq!(provider.calls(), 3);
        assert_eq!(limiter.in_flight(), 0);
        let metrics = store.get("test").unwrap();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.provider_calls, 3);
    }

    #[tokio::test]
    async fn test_every_attempt_uses_a_request_slot() {
        let provider = Arc::new(MockProvider::with_responder(|_, call| {
            if call < 2 {
                Err(Error::transient(TransientKind::Timeout, "slow"))
            } else {
                Ok("done".to_string())
            }
        }));
        let limiter: Arc<dyn RateLimiter> = Arc::new(
            QuotaRateLimiter::new(
                "test",
                &RateLimitConfig {
                    requests_per_period: Some(4),
                    period_secs: 60,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap(),
        );
        let handler = MiddlewarePipeline::new()
            .with(RateLimitMiddleware::new(limiter.clone(), None))
            .with(
                RetryMiddleware::new(Retrier::new(5, Arc::new(ImmediateBackoff)))
                    .with_rate_limiter(limiter.clone(), None),
            )
            .build(provider_handler(provider.clone()));
        let cancel = CancellationToken::new();

        handler(CompletionRequest::prompt("q"), cancel.clone()).await.unwrap();
        assert_eq!(provider.calls(), 3);

        // Three attempts took three of the four slots
        let deadline = || Some(tokio::time::Instant::now() + Duration::from_millis(50));
        limiter.acquire(1, deadline(), &cancel).await.unwrap().release();
        let err = limiter.acquire(1, deadline(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failure_injection_always_fails_at_rate_one() {
        let handler = MiddlewarePipeline::new()
            .with(FailureInjectionMiddleware::new(1.0))
            .build(provider_handler(Arc::new(MockProvider::new(vec![]))));
        let err = handler(CompletionRequest::prompt("q"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_provider_handler_observes_cancellation() {
        let provider = Arc::new(MockProvider::new(vec![]).with_delay(Duration::from_secs(30)));
        let handler = MiddlewarePipeline::new()
            .with(RateLimitMiddleware::new(Arc::new(UnboundedRateLimiter), None))
            .build(provider_handler(provider));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handler(CompletionRequest::prompt("q"), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
