//! Retry-with-backoff helper, separate from bus redelivery.
//!
//! Used exclusively for transient external calls within a single handler
//! invocation (embedder, LLM, remote stores). Bus redelivery
//! (nack-requeue-once-then-dead-letter) is a different mechanism and must
//! not be counted against the same `max_retries`.

use crate::constants::{DEFAULT_RETRY_BASE_BACKOFF_SECONDS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_BACKOFF_SECONDS};
use crate::errors::CoreError;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Jitter fraction applied symmetrically around the computed backoff
    /// (±20% by default).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_backoff: Duration::from_secs(DEFAULT_RETRY_BASE_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(DEFAULT_RETRY_MAX_BACKOFF_SECONDS),
            jitter_fraction: 0.20,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with a cap, before jitter is applied:
    /// `min(base * 2^(attempt-1), max)`.
    fn exponential_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let factor = 2u64.saturating_pow(exp);
        let millis = self.base_backoff.as_millis() as u64;
        let backoff_millis = millis.saturating_mul(factor);
        Duration::from_millis(backoff_millis).min(self.max_backoff)
    }

    /// Applies ±`jitter_fraction` jitter to the base backoff.
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.exponential_backoff(attempt);
        let base_millis = base.as_millis() as f64;
        let delta = base_millis * self.jitter_fraction;
        let low = (base_millis - delta).max(0.0);
        let high = base_millis + delta;
        let millis = if high > low { rand::thread_rng().gen_range(low..=high) } else { base_millis };
        Duration::from_millis(millis as u64)
    }
}

/// Cooperative cancellation signal shared by a process; shutdown (SIGTERM)
/// sets this flag, which interrupts the retry helper's in-progress sleep
/// and returns the last observed error.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Hooks invoked by `retry_with_backoff`: `on_retry` on each retry
/// (before sleeping), `on_failure` once attempts are exhausted.
pub trait RetryHooks: Send + Sync {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &CoreError) {
        let _ = (attempt, delay, error);
    }
    fn on_failure(&self, attempts: u32, error: &CoreError) {
        let _ = (attempts, error);
    }
}

/// Default hooks that only log; sufficient for stages that don't need
/// extra observability.
pub struct LoggingRetryHooks;

impl RetryHooks for LoggingRetryHooks {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &CoreError) {
        log::warn!("retry attempt {attempt} after {delay:?}: {error}");
    }
    fn on_failure(&self, attempts: u32, error: &CoreError) {
        log::error!("retry exhausted after {attempts} attempts: {error}");
    }
}

/// Runs `op`, retrying with exponential backoff + jitter when `op`
/// returns a `CoreError::TransientError`. Any other `CoreError` variant
/// propagates immediately without retrying. Cooperative cancellation
/// interrupts the sleep and returns the last error.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    hooks: &dyn RetryHooks,
    cancellation: &CancellationToken,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if !err.is_transient() {
                    return Err(err);
                }
                if attempt >= config.max_attempts || cancellation.is_cancelled() {
                    hooks.on_failure(attempt, &err);
                    return Err(err);
                }
                let delay = config.jittered_backoff(attempt);
                hooks.on_retry(attempt, delay, &err);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_cancellation(cancellation) => {
                        hooks.on_failure(attempt, &err);
                        return Err(err);
                    }
                }
            }
        }
    }
}

async fn wait_for_cancellation(token: &CancellationToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct NoopHooks;
    impl RetryHooks for NoopHooks {}

    #[tokio::test]
    async fn succeeds_without_retry_on_ok() {
        let cfg = RetryConfig::default();
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry_with_backoff(&cfg, &NoopHooks, &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_error_is_never_retried() {
        let cfg = RetryConfig::default();
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry_with_backoff(&cfg, &NoopHooks, &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::PermanentError("bad shape".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_up_to_max_attempts() {
        let cfg = RetryConfig { max_attempts: 3, base_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(5), jitter_fraction: 0.2 };
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry_with_backoff(&cfg, &NoopHooks, &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::TransientError("timeout".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let cfg = RetryConfig { max_attempts: 5, base_backoff: Duration::from_secs(5), max_backoff: Duration::from_secs(60), jitter_fraction: 0.2 };
        for attempt in 1..=5 {
            let base = cfg.exponential_backoff(attempt).as_millis() as f64;
            for _ in 0..20 {
                let jittered = cfg.jittered_backoff(attempt).as_millis() as f64;
                assert!(jittered >= base * 0.8 - 1.0);
                assert!(jittered <= base * 1.2 + 1.0);
            }
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let cfg = RetryConfig::default();
        let huge = cfg.exponential_backoff(30);
        assert_eq!(huge, cfg.max_backoff);
    }
}
