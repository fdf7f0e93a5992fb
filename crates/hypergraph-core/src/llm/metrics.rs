//! Per-model completion metrics and cost accounting
//!
//! This module provides:
//! - Counters per model instance (requests, cache hits, retries, failures)
//! - Token usage and latency totals
//! - Cost calculation through a pricing registry (per million tokens)

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::Usage;

/// Pricing information for a model (per million tokens)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    /// Cost per million input tokens in USD
    pub input_price_per_million: f64,
    /// Cost per million output tokens in USD
    pub output_price_per_million: f64,
}

impl ModelPricing {
    pub fn new(model: impl Into<String>, input_price: f64, output_price: f64) -> Self {
        Self {
            model: model.into(),
            input_price_per_million: input_price,
            output_price_per_million: output_price,
        }
    }

    /// Cost in USD for the given usage
    pub fn calculate_cost(&self, usage: &Usage) -> f64 {
        let input = (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_price_per_million;
        let output =
            (usage.completion_tokens as f64 / 1_000_000.0) * self.output_price_per_million;
        input + output
    }
}

/// Model name → pricing
#[derive(Debug, Clone, Default)]
pub struct CostRegistry {
    prices: HashMap<String, ModelPricing>,
}

impl CostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with list prices for common OpenAI-compatible models
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (model, input, output) in [
            ("gpt-4o", 2.50, 10.0),
            ("gpt-4o-mini", 0.15, 0.60),
            ("gpt-4.1", 2.0, 8.0),
            ("gpt-4.1-mini", 0.40, 1.60),
            ("gpt-4.1-nano", 0.10, 0.40),
            ("o3-mini", 1.10, 4.40),
        ] {
            registry.register(ModelPricing::new(model, input, output));
        }
        registry
    }

    pub fn register(&mut self, pricing: ModelPricing) {
        self.prices.insert(pricing.model.clone(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.prices.get(model)
    }

    /// Cost in USD, zero for unpriced models
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        self.get(model)
            .map(|pricing| pricing.calculate_cost(usage))
            .unwrap_or(0.0)
    }
}

/// Counters for one model instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    /// Requests entering the pipeline
    pub requests: u64,
    /// Requests answered from cache
    pub cache_hits: u64,
    /// Calls that reached the provider
    pub provider_calls: u64,
    pub retries: u64,
    /// Requests that ultimately failed
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_latency_ms: u64,
    pub cost_usd: f64,
}

impl ModelMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Mean latency of non-cached successful requests
    pub fn average_latency_ms(&self) -> Option<f64> {
        let answered = self.requests.saturating_sub(self.cache_hits + self.failures);
        (answered > 0).then(|| self.total_latency_ms as f64 / answered as f64)
    }
}

/// Thread-safe metrics store shared by all gateways of a run
#[derive(Debug, Clone)]
pub struct MetricsStore {
    inner: Arc<Mutex<BTreeMap<String, ModelMetrics>>>,
    pricing: Arc<CostRegistry>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(CostRegistry::with_defaults())
    }
}

impl MetricsStore {
    pub fn new(pricing: CostRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            pricing: Arc::new(pricing),
        }
    }

    fn update(&self, instance: &str, f: impl FnOnce(&mut ModelMetrics)) {
        // A poisoned lock only means another recorder panicked; counters stay usable
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.entry(instance.to_string()).or_default());
    }

    pub fn record_request(&self, instance: &str) {
        self.update(instance, |m| m.requests += 1);
    }

    pub fn record_cache_hit(&self, instance: &str) {
        self.update(instance, |m| m.cache_hits += 1);
    }

    pub fn record_provider_call(&self, instance: &str) {
        self.update(instance, |m| m.provider_calls += 1);
    }

    pub fn record_retry(&self, instance: &str) {
        self.update(instance, |m| m.retries += 1);
    }

    pub fn record_failure(&self, instance: &str) {
        self.update(instance, |m| m.failures += 1);
    }

    /// Record a successful provider response
    pub fn record_success(&self, instance: &str, model: &str, usage: &Usage, latency: Duration) {
        let cost = self.pricing.cost(model, usage);
        self.update(instance, |m| {
            m.prompt_tokens += u64::from(usage.prompt_tokens);
            m.completion_tokens += u64::from(usage.completion_tokens);
            m.total_latency_ms += latency.as_millis() as u64;
            m.cost_usd += cost;
        });
    }

    /// Metrics for one instance
    pub fn get(&self, instance: &str) -> Option<ModelMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(instance)
            .cloned()
    }

    /// Snapshot of every instance, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, ModelMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Total cost across all instances
    pub fn total_cost_usd(&self) -> f64 {
        self.snapshot().values().map(|m| m.cost_usd).sum()
    }
}
