//! Bounded retries with exponential backoff and jitter.

use imagegen_mcp_common::error::{Error, ProviderError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(20);

/// Retry policy for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Exponential ceiling for retry number `retry` (1-based), capped.
    fn ceiling(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full-jitter delay before retry number `retry` (1-based).
    ///
    /// The delay is drawn uniformly from `[0, ceiling]`. A server-requested
    /// delay raises the floor, still bounded by `max_delay`.
    pub fn backoff(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let ceiling = self.ceiling(retry);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms));
        match retry_after {
            Some(requested) => delay.max(requested).min(self.max_delay),
            None => delay,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProviderFailed` carrying the last provider error and
    /// the number of attempts made.
    pub async fn run<T, F, Fut>(&self, provider: &str, mut call: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.backoff(attempt, e.retry_after);
                    warn!(
                        provider,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        kind = %e.kind,
                        "retrying after transient error: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::ProviderFailed {
                        provider: provider.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegen_mcp_common::error::ProviderErrorKind;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = instant(3)
            .run("openai", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::from_status("openai", 503, "busy"))
                } else {
                    Ok("image")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "image");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = instant(3)
            .run("openai", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::from_status("openai", 400, "bad size"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            Error::ProviderFailed { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.kind, ProviderErrorKind::BadRequest);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let calls = AtomicU32::new(0);
        let err = instant(2)
            .run("gemini", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::new("gemini", ProviderErrorKind::Timeout, "slow"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, Error::ProviderFailed { attempts: 3, .. }));
    }

    #[test]
    fn test_retry_after_raises_floor_but_respects_cap() {
        let policy =
            RetryPolicy::new(3).with_delays(Duration::from_millis(10), Duration::from_secs(5));
        let delay = policy.backoff(1, Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(2));
        let delay = policy.backoff(1, Some(Duration::from_secs(60)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    proptest! {
        /// Jittered delays never exceed the exponential ceiling or the cap.
        #[test]
        fn backoff_stays_within_bounds(retry in 1u32..12) {
            let policy = RetryPolicy::default();
            let ceiling = policy.ceiling(retry);
            let delay = policy.backoff(retry, None);
            prop_assert!(delay <= ceiling);
            prop_assert!(delay <= DEFAULT_MAX_DELAY);
        }
    }

    #[test]
    fn test_backoff_spans_the_whole_range() {
        let policy = RetryPolicy::new(3)
            .with_delays(Duration::from_millis(1000), Duration::from_secs(20));
        let ceiling = policy.ceiling(1);
        let delays: Vec<Duration> = (0..500).map(|_| policy.backoff(1, None)).collect();
        assert!(delays.iter().any(|d| *d < ceiling / 2));
        assert!(delays.iter().all(|d| *d <= ceiling));
    }
}
