//! Bounded retry with exponential backoff
//!
//! Used wherever an operation can lose a race against another writer and is
//! worth attempting again after some corrective work (e.g. a manifest push
//! rejected because the remote branch moved). The operation itself decides
//! whether a failure is retriable by returning [`Attempt::Retry`].

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Configuration for exponential backoff retry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting the initial attempt)
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// A single retry after a short pause
    pub const ONCE: Self = Self {
        max_retries: 1,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
    };

    /// No retries at all
    pub const NEVER: Self = Self {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: initial_delay.saturating_mul(8),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (0-indexed), capped at `max_delay`
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(retry as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::ONCE
    }
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Failed, but attempting again may succeed
    Retry(E),
    /// Failed for good
    Fail(E),
}

/// Runs `operation` until it succeeds, fails permanently or retries run out
///
/// The closure receives the attempt number, starting at 0, so it can do
/// corrective work (like rebasing) before every attempt after the first.
/// When retries are exhausted the last retriable error is returned.
pub async fn retry<T, E, F, Fut>(label: &str, config: RetryConfig, mut operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(e) => return Err(e),
            Attempt::Retry(e) => {
                if attempt >= config.max_retries {
                    warn!("{} failed after {} attempt(s): {}", label, attempt + 1, e);
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, String> = retry("op", fast(2), |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    Attempt::Retry("busy".to_string())
                } else {
                    Attempt::Done(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_error() {
        let result: Result<(), String> = retry("op", fast(1), |attempt| async move {
            Attempt::Retry(format!("rejected #{}", attempt))
        })
        .await;
        assert_eq!(result, Err("rejected #1".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = retry("op", fast(3), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Attempt::Fail("conflict".to_string())
            }
        })
        .await;
        assert_eq!(result, Err("conflict".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_never_runs_once() {
        let result: Result<(), String> =
            retry("op", RetryConfig::NEVER, |_| async { Attempt::Retry("x".to_string()) }).await;
        assert!(result.is_err());
    }
}
