//! LLM completion pipeline
//!
//! This module provides:
//! - Provider-neutral request/response types
//! - Completion providers (OpenAI-compatible HTTP, scripted mock)
//! - Rate limiting per model instance with RAII permits
//! - Bounded retries with exponential backoff and jitter
//! - Middleware composition (logging, metrics, cache, rate limit, retry)
//! - The completion gateway and its factory
//! - Per-model metrics with cost accounting

mod completion;
mod metrics;
mod middleware;
mod openai;
mod provider;
mod rate_limit;
mod retry;
mod types;

pub use completion::{CompletionFactory, LlmCompletion, Registries, create_completion};
pub use metrics::{CostRegistry, MetricsStore, ModelMetrics, ModelPricing};
pub use middleware::{
    CacheMiddleware, CompletionFuture, CompletionHandler, FailureInjectionMiddleware,
    LoggingMiddleware, MetricsMiddleware, Middleware, MiddlewarePipeline, RateLimitMiddleware,
    RetryMiddleware, handler_fn, provider_handler,
};
pub use openai::{OpenAiCompatibleProvider, OpenAiCompatibleProviderBuilder};
pub use provider::{
    CompletionProvider, MockProvider, MockResponder, ProviderFactory, ProviderRegistry,
    default_providers,
};
pub use rate_limit::{
    RateLimitPermit, RateLimiter, RateLimiterFactory, RateLimiterRegistry,
    QuotaRateLimiter, UnboundedRateLimiter, default_rate_limiters,
};
pub use retry::{
    Backoff, BackoffFactory, ExponentialBackoff, ImmediateBackoff, Retrier, RetryRegistry,
    default_retry_strategies,
};
pub use types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, MessageRole, Usage,
};
