//! Bounded exponential backoff for remote calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Result;

/// Retry policy: `max_attempts` tries with delays `base * 2^(n-1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// A policy of zero attempts still tries once
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Try exactly once
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the `failure`-th failed attempt (1-based)
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Longest total time spent sleeping before giving up
    pub fn total_delay_bound(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|n| self.delay_for(n)).sum()
    }

    /// Run `operation`, retrying on any error until attempts are exhausted
    ///
    /// The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    warn!(operation = name, attempt, error = %e, "giving up after final attempt");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(100), Duration::from_millis(250))
    }

    #[test]
    fn delays_double_then_cap() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(250));
        assert_eq!(p.delay_for(40), Duration::from_millis(250));
        assert_eq!(p.total_delay_bound(), Duration::from_millis(800));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(policy(0).max_attempts, 1);
        assert_eq!(policy(0).total_delay_bound(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_stops_at_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let p = policy(4);
        let started = tokio::time::Instant::now();

        let result: Result<()> = p
            .run("flaky", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::remote("llm", "503"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let elapsed = started.elapsed();
        assert!(elapsed >= p.total_delay_bound());
        assert!(elapsed < p.total_delay_bound() + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = policy(3)
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::remote("vault", "busy"))
                } else {
                    Ok(n)
                }
            })
            .await;

        tokio_test::assert_ok!(&value);
        assert_eq!(value.unwrap(), 2);
    }

    #[tokio::test]
    async fn last_error_is_returned() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::once()
            .run::<(), _, _>("single", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_found("nothing"))
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::NotFound(_)));
    }
}
