//! Exponential backoff for stage steps.

use std::future::Future;
use std::time::Duration;

use sieve_common::config::RetryConfig;
use thiserror::Error;
use tracing::{info, warn};

use super::CancelToken;

/// Why a retried step gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("{step} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{step} failed: {error}")]
    Permanent { step: String, error: String },

    #[error("{step} cancelled")]
    Cancelled { step: String },
}

/// Attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();
        // Clamp before converting; huge exponents overflow Duration
        if !delay.is_finite() || delay >= cap {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, the
    /// budget is spent or the token is cancelled.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        step: &str,
        cancel: &CancelToken,
        retryable: R,
        mut op: F,
    ) -> Result<T, StepError>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled { step: step.to_string() });
            }
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(step, attempt, "Step recovered after retries");
                    }
                    return Ok(value);
                }
                Err(e) if !retryable(&e) => {
                    return Err(StepError::Permanent {
                        step: step.to_string(),
                        error: e.to_string(),
                    });
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(StepError::Exhausted {
                        step: step.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        step,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_saturates_for_long_budgets() {
        let policy = RetryPolicy::default();
        for attempt in [65, 70, 100, 1_100, u32::MAX] {
            assert_eq!(policy.backoff_for(attempt), policy.max_backoff);
        }
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("fetch", &CancelToken::new(), |_: &String| true, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("boom".to_string())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("persist", &CancelToken::new(), |_: &String| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("locked".to_string())
            })
            .await;

        assert_eq!(
            result,
            Err(StepError::Exhausted {
                step: "persist".into(),
                attempts: 2,
                last_error: "locked".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("fetch", &CancelToken::new(), |_: &String| false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request".to_string())
            })
            .await;

        assert!(matches!(result, Err(StepError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("fetch", &cancel, |_: &String| true, || async { Ok::<_, String>(()) })
            .await;
        assert!(matches!(result, Err(StepError::Cancelled { .. })));
    }
}
