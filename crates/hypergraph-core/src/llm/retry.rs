//! Retry with bounded attempts and backoff
//!
//! Only transient errors (see [`Error::is_transient`]) are retried. After
//! `max_attempts` total attempts the last transient error is wrapped in
//! `ExhaustedRetries`. Backoff sleeps abort as soon as the stage is
//! cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Error, Result, TransientKind};
use crate::registry::Registry;

/// Delay schedule between attempts
pub trait Backoff: Send + Sync {
    /// Delay after failed attempt number `attempt` (1-based)
    fn delay(&self, attempt: u32, error: &Error) -> Duration;
}

/// `base * 2^(attempt-1)`, capped, with optional jitter of up to 25%
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32, error: &Error) -> Duration {
        // Provider-suggested wait takes precedence when it is longer
        let suggested = match error {
            Error::TransientProvider {
                kind:
                    TransientKind::RateLimited {
                        retry_after_secs: Some(secs),
                    },
                ..
            } => Duration::from_secs(*secs),
            _ => Duration::ZERO,
        };

        let exponent = attempt.saturating_sub(1).min(20);
        let computed = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        let jitter = if self.jitter {
            computed.mul_f64(rand::random::<f64>() * 0.25)
        } else {
            Duration::ZERO
        };

        (computed + jitter).max(suggested).min(self.max.max(suggested))
    }
}

/// Retry straight away
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateBackoff;

impl Backoff for ImmediateBackoff {
    fn delay(&self, _attempt: u32, _error: &Error) -> Duration {
        Duration::ZERO
    }
}

/// Constructor signature stored in the retry registry
pub type BackoffFactory = dyn Fn(&RetryConfig) -> Arc<dyn Backoff> + Send + Sync;

/// Registry of backoff strategies keyed by `retry.strategy`
pub type RetryRegistry = Registry<BackoffFactory>;

/// Registry pre-populated with `exponential_backoff` and `immediate`
pub fn default_retry_strategies() -> RetryRegistry {
    let mut registry = RetryRegistry::new("retry");
    registry
        .register(
            "exponential_backoff",
            Arc::new(|config: &RetryConfig| {
                Arc::new(ExponentialBackoff {
                    base: Duration::from_millis(config.base_delay_ms),
                    max: Duration::from_millis(config.max_delay_ms),
                    jitter: config.jitter,
                }) as Arc<dyn Backoff>
            }),
        )
        .register(
            "immediate",
            Arc::new(|_: &RetryConfig| Arc::new(ImmediateBackoff) as Arc<dyn Backoff>),
        );
    registry
}

/// Re-invokes a failing operation under a bounded policy
#[derive(Clone)]
pub struct Retrier {
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Retrier {
    pub fn new(max_attempts: u32, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Build from configuration, resolving the strategy through `registry`
    pub fn from_config(config: &RetryConfig, registry: &RetryRegistry) -> Result<Self> {
        let backoff = registry.get(&config.strategy)?(config);
        Ok(Self::new(config.max_attempts, backoff))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with_observer(cancel, operation, |_, _| {}).await
    }

    /// Like [`Retrier::run`], calling `on_retry(attempt, error)` before each backoff
    pub async fn run_with_observer<T, F, Fut, O>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(u32, &Error),
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(Error::ExhaustedRetries {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = self.backoff.delay(attempt, &err);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying after backoff"
                    );
                    on_retry(attempt, &err);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn immediate(max_attempts: u32) -> Retrier {
        Retrier::new(max_attempts, Arc::new(ImmediateBackoff))
    }

    fn timeout() -> Error {
        Error::transient(TransientKind::Timeout, "slow")
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_attempted_exactly_n_times() {
        let retrier = immediate(4);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = retrier
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(timeout()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            Error::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.is_transient());
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let retrier = immediate(5);
        let cancel = CancellationToken::new();
        let mut retries = Vec::new();

        let value = retrier
            .run_with_observer(
                &cancel,
                |attempt| async move {
                    if attempt < 3 { Err(timeout()) } else { Ok(attempt) }
                },
                |attempt, _| retries.push(attempt),
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let retrier = immediate(5);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = retrier
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::TerminalProvider("bad request".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::TerminalProvider(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let retrier = Retrier::new(
            10,
            Arc::new(ExponentialBackoff {
                base: Duration::from_secs(60),
                max: Duration::from_secs(600),
                jitter: false,
            }),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result: Result<()> = retrier.run(&cancel, |_| async { Err(timeout()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_schedule() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: false,
        };
        let err = timeout();
        assert_eq!(backoff.delay(1, &err), Duration::from_millis(100));
        assert_eq!(backoff.delay(2, &err), Duration::from_millis(200));
        assert_eq!(backoff.delay(3, &err), Duration::from_millis(400));
        assert_eq!(backoff.delay(10, &err), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff.delay(1, &timeout());
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_backoff_honours_retry_after() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: false,
        };
        let err = Error::transient(
            TransientKind::RateLimited {
                retry_after_secs: Some(5),
            },
            "429",
        );
        assert_eq!(backoff.delay(1, &err), Duration::from_secs(5));
    }

    #[test]
    fn test_from_config_unknown_strategy() {
        let registry = default_retry_strategies();
        let config = RetryConfig {
            strategy: "fibonacci".into(),
            ..RetryConfig::default()
        };
        assert!(matches!(
            Retrier::from_config(&config, &registry),
            Err(Error::UnknownStrategy { .. })
        ));

        let retrier = Retrier::from_config(&RetryConfig::default(), &registry).unwrap();
        assert_eq!(retrier.max_attempts(), 5);
    }
}
