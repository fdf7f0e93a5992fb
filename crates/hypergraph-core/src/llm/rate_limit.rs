//! Rate limiting per logical model instance
//!
//! A limiter bounds two things:
//! - concurrency: at most `max_concurrent` permits are outstanding
//! - throughput: requests and estimated tokens per period, enforced with
//!   `governor` quotas
//!
//! Permits are RAII guards; dropping one releases its concurrency slot, so
//! failed or cancelled calls never leak capacity. Every provider attempt is
//! charged against the throughput budgets, retries included.

use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, InsufficientCapacity, Quota};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Capacity held by one in-flight call; released on drop
pub struct RateLimitPermit {
    slot: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl RateLimitPermit {
    fn new(slot: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            slot,
            acquired_at: Instant::now(),
        }
    }

    /// How long this permit has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Explicitly release the permit (normally done automatically on drop)
    pub fn release(self) {}
}

impl fmt::Debug for RateLimitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPermit")
            .field("bounded", &self.slot.is_some())
            .finish()
    }
}

/// Gate in front of provider calls
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait for a concurrency slot and charge the first attempt's budget.
    ///
    /// Fails with `RateLimitTimeout` once `deadline` passes and with
    /// `Cancelled` when `cancel` fires; in both cases nothing stays held.
    async fn acquire(
        &self,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitPermit>;

    /// Charge one more provider attempt made under an already held permit
    async fn charge(
        &self,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Permits currently outstanding
    fn in_flight(&self) -> usize;
}

/// Constructor signature stored in the rate limiter registry
pub type RateLimiterFactory =
    dyn Fn(&str, &RateLimitConfig) -> Result<Arc<dyn RateLimiter>> + Send + Sync;

/// Registry of rate limiters keyed by `rate_limit.strategy`
pub type RateLimiterRegistry = Registry<RateLimiterFactory>;

/// Registry pre-populated with `quota` and `none`
pub fn default_rate_limiters() -> RateLimiterRegistry {
    let mut registry = RateLimiterRegistry::new("rate limit");
    registry
        .register(
            "quota",
            Arc::new(|instance: &str, config: &RateLimitConfig| {
                Ok(Arc::new(QuotaRateLimiter::new(instance, config)?) as Arc<dyn RateLimiter>)
            }),
        )
        .register(
            "none",
            Arc::new(|_: &str, _: &RateLimitConfig| {
                Ok(Arc::new(UnboundedRateLimiter) as Arc<dyn RateLimiter>)
            }),
        );
    registry
}

/// `amount` cells per `period`, all of them available as a burst
fn budget_quota(field: &str, amount: u64, period: Duration) -> Result<Quota> {
    let burst = NonZeroU32::new(u32::try_from(amount).unwrap_or(u32::MAX))
        .ok_or_else(|| Error::ConfigError(format!("rate_limit.{} must be greater than 0", field)))?;
    Quota::with_period(period / burst.get())
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "rate_limit.{} is too large for a {}s period",
                field,
                period.as_secs()
            ))
        })
}

/// Concurrency ceiling plus request/token quotas
pub struct QuotaRateLimiter {
    instance: String,
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    requests: Option<DefaultDirectRateLimiter>,
    tokens: Option<DefaultDirectRateLimiter>,
}

impl fmt::Debug for QuotaRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaRateLimiter")
            .field("instance", &self.instance)
            .field("max_concurrent", &self.max_concurrent)
            .field("request_budget", &self.requests.is_some())
            .field("token_budget", &self.tokens.is_some())
            .finish()
    }
}

impl QuotaRateLimiter {
    pub fn new(instance: impl Into<String>, config: &RateLimitConfig) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(Error::ConfigError(
                "rate_limit.max_concurrent must be greater than 0".to_string(),
            ));
        }
        let period = Duration::from_secs(config.period_secs.max(1));
        let requests = config
            .requests_per_period
            .map(|n| budget_quota("requests_per_period", u64::from(n), period))
            .transpose()?
            .map(DefaultDirectRateLimiter::direct);
        let tokens = config
            .tokens_per_period
            .map(|n| budget_quota("tokens_per_period", n, period))
            .transpose()?
            .map(DefaultDirectRateLimiter::direct);

        Ok(Self {
            instance: instance.into(),
            max_concurrent: config.max_concurrent,
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            requests,
            tokens,
        })
    }

    /// Wait until both quotas admit one request of `estimated_tokens`
    async fn admit(&self, estimated_tokens: u64) {
        if let Some(requests) = &self.requests {
            requests.until_ready().await;
        }
        if let Some(tokens) = &self.tokens {
            let cells = NonZeroU32::new(u32::try_from(estimated_tokens).unwrap_or(u32::MAX))
                .unwrap_or(NonZeroU32::MIN);
            // A request larger than the whole budget waits for a full bucket and drains it
            if let Err(InsufficientCapacity(capacity)) = tokens.until_n_ready(cells).await {
                debug!(
                    instance = %self.instance,
                    estimated_tokens,
                    capacity,
                    "Request exceeds token budget, admitting alone"
                );
                if let Some(full) = NonZeroU32::new(capacity) {
                    let _ = tokens.until_n_ready(full).await;
                }
            }
        }
    }

    async fn wait_for_capacity(&self, estimated_tokens: u64) -> Result<RateLimitPermit> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other(format!("rate limiter '{}' closed", self.instance)))?;
        self.admit(estimated_tokens).await;
        Ok(RateLimitPermit::new(Some(slot)))
    }

    /// Run `wait` under the caller's deadline and cancellation token.
    ///
    /// Dropping the pending future returns anything it already took.
    async fn bounded<T>(
        &self,
        wait: impl Future<Output = Result<T>>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, wait)
                        .await
                        .unwrap_or_else(|_| {
                            let waited_ms = started.elapsed().as_millis() as u64;
                            warn!(instance = %self.instance, waited_ms, "Rate limit acquisition timed out");
                            Err(Error::RateLimitTimeout {
                                instance: self.instance.clone(),
                                waited_ms,
                            })
                        }),
                    None => wait.await,
                }
            } => result,
        }
    }
}

#[async_trait]
impl RateLimiter for QuotaRateLimiter {
    async fn acquire(
        &self,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitPermit> {
        self.bounded(self.wait_for_capacity(estimated_tokens), deadline, cancel)
            .await
    }

    async fn charge(
        &self,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.bounded(
            async {
                self.admit(estimated_tokens).await;
                Ok(())
            },
            deadline,
            cancel,
        )
        .await
    }

    fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }
}

/// Limiter that never waits
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedRateLimiter;

#[async_trait]
impl RateLimiter for UnboundedRateLimiter {
    async fn acquire(
        &self,
        _estimated_tokens: u64,
        _deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitPermit> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(RateLimitPermit::new(None))
    }

    async fn charge(
        &self,
        _estimated_tokens: u64,
        _deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_concurrent: usize) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency_ceiling() {
        let limiter = Arc::new(QuotaRateLimiter::new("test", &config(3)).unwrap());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let permit = limiter.acquire(1, None, &cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(limiter.in_flight() <= 3);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_timeout_and_releases() {
        let limiter = QuotaRateLimiter::new("gpt", &config(1)).unwrap();
        let cancel = CancellationToken::new();
        let held = limiter.acquire(1, None, &cancel).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = limiter
            .acquire(1, Some(deadline), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitTimeout { ref instance, .. } if instance == "gpt"));

        held.release();
        assert_eq!(limiter.in_flight(), 0);
        let _again = limiter.acquire(1, None, &cancel).await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let limiter = QuotaRateLimiter::new("gpt", &config(1)).unwrap();
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(1, None, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = limiter.acquire(1, None, &waiter_cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_request_budget_waits_for_replenishment() {
        let limiter = QuotaRateLimiter::new(
            "gpt",
            &RateLimitConfig {
                max_concurrent: 10,
                requests_per_period: Some(2),
                period_secs: 1,
                ..RateLimitConfig::default()
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..2 {
            limiter.acquire(1, None, &cancel).await.unwrap().release();
        }
        assert!(start.elapsed() < Duration::from_millis(200));

        // The third request waits for one cell to come back (period / 2)
        limiter.acquire(1, None, &cancel).await.unwrap().release();
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_charge_consumes_request_budget_without_slot() {
        let limiter = QuotaRateLimiter::new(
            "gpt",
            &RateLimitConfig {
                requests_per_period: Some(2),
                period_secs: 60,
                ..RateLimitConfig::default()
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let permit = limiter.acquire(1, None, &cancel).await.unwrap();
        limiter.charge(1, None, &cancel).await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
        drop(permit);

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = limiter.acquire(1, Some(deadline), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitTimeout { .. }));
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_admitted_alone() {
        let limiter = QuotaRateLimiter::new(
            "gpt",
            &RateLimitConfig {
                tokens_per_period: Some(100),
                period_secs: 60,
                ..RateLimitConfig::default()
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(500, None, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        // The oversized request drained the bucket
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = limiter.acquire(10, Some(deadline), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitTimeout { .. }));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = RateLimitConfig {
            requests_per_period: Some(0),
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            QuotaRateLimiter::new("x", &config),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(QuotaRateLimiter::new("x", &config(0)).is_err());
    }

    #[tokio::test]
    async fn test_registry_defaults() {
        let registry = default_rate_limiters();
        assert_eq!(registry.names(), vec!["none", "quota"]);
        let limiter = registry.get("none").unwrap()("x", &RateLimitConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        limiter.acquire(10, None, &cancel).await.unwrap();
        assert!(registry.get("token_bucket").is_err());
    }
}
