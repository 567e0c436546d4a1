//! Retry policy for activities
//!
//! Exponential backoff with a cap for transient platform errors. Throttling
//! responses that carry a reset time wait for the reset instead of blind
//! backoff. Permanent errors fail immediately.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy applied to one activity invocation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.initial_secs),
            multiplier: config.multiplier,
            cap: Duration::from_secs(config.cap_secs),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Policy for units critical to the whole run (repository metadata);
    /// same backoff, more attempts
    pub fn critical(&self) -> Self {
        Self {
            max_attempts: self.max_attempts * 2,
            ..self.clone()
        }
    }

    /// Backoff before the given 1-based attempt number
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let backoff = self.initial.mul_f64(factor);
        backoff.min(self.cap)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    warn!(activity = name, attempts = attempt, "Retries exhausted: {}", err);
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    // Honor the platform's reset time when it reported one
                    let wait = err
                        .retry_after()
                        .and_then(|d| d.to_std().ok())
                        .map(|d| d.min(self.cap))
                        .unwrap_or_else(|| self.backoff(attempt));
                    debug!(
                        activity = name,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Retrying after error: {}",
                        err
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            multiplier: 2.0,
            cap: Duration::from_millis(8),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: 10,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(5), Duration::from_secs(60));
        assert_eq!(policy.backoff(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast_policy(5)
            .run("flaky", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Transient("502".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast_policy(5)
            .run("missing", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("repo".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let result: Result<()> = fast_policy(3)
            .run("down", || async { Err(Error::Transient("timeout".into())) })
            .await;

        match result {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limit_reset_bounds_the_wait() {
        // reset far in the future must be capped, not waited out
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = std::time::Instant::now();

        let result = fast_policy(2)
            .run("throttled", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::RateLimited {
                            remaining: Some(0),
                            reset_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
