//! Batched, paced retrieval of per-symbol payloads.
//!
//! Symbols are fetched one at a time with a fixed delay between calls.
//! A failure for one symbol is logged and skipped; the batch continues.
//! Only a run of consecutive transient failures (the circuit breaker
//! opening) or cancellation aborts the whole batch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ProviderError, RateLimiter};
use crate::circuit_breaker::CircuitBreaker;
use crate::funnel::CancelToken;

// ============================================================================
// Errors & Results
// ============================================================================

/// Whole-batch failures. Per-symbol failures never surface here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The provider looks down: too many consecutive transient failures.
    #[error("provider circuit open after {consecutive_failures} consecutive failures: {last_error}")]
    CircuitOpen {
        consecutive_failures: u32,
        last_error: String,
    },

    #[error("fetch cancelled after {completed} of {requested} symbols")]
    Cancelled { completed: usize, requested: usize },
}

/// One skipped symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub symbol: String,
    pub error: String,
    /// Whether the failure counted toward the circuit breaker
    pub transient: bool,
}

/// Successful payloads in input order, plus the skipped symbols.
#[derive(Debug, Clone)]
pub struct FetchedBatch<T> {
    entries: Vec<(String, T)>,
    failures: Vec<FetchFailure>,
    requested: usize,
}

impl<T> FetchedBatch<T> {
    /// Number of distinct symbols requested.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when symbols were requested and none came back.
    pub fn all_failed(&self) -> bool {
        self.requested > 0 && self.entries.is_empty()
    }

    pub fn failures(&self) -> &[FetchFailure] {
        &self.failures
    }

    pub fn entries(&self) -> &[(String, T)] {
        &self.entries
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(s, _)| s.as_str())
    }

    pub fn get(&self, symbol: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, payload)| payload)
    }

    pub fn into_entries(self) -> Vec<(String, T)> {
        self.entries
    }
}

// ============================================================================
// Batched Fetcher
// ============================================================================

/// Paced sequential fetcher with a shared circuit breaker.
pub struct BatchedFetcher {
    name: String,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
}

impl BatchedFetcher {
    pub fn new(name: impl Into<String>, delay: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        let name = name.into();
        Self {
            limiter: RateLimiter::new(name.clone(), delay),
            name,
            breaker,
        }
    }

    /// Fetch every symbol once, in order.
    ///
    /// Duplicate symbols are fetched only for their first occurrence.
    pub async fn fetch_batch<T, F, Fut>(
        &self,
        symbols: &[String],
        fetch_one: F,
        cancel: &CancelToken,
    ) -> Result<FetchedBatch<T>, FetchError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut seen = HashSet::with_capacity(symbols.len());
        let unique: Vec<&String> = symbols.iter().filter(|s| seen.insert(s.as_str())).collect();
        let requested = unique.len();

        let mut batch = FetchedBatch {
            entries: Vec::with_capacity(requested),
            failures: Vec::new(),
            requested,
        };

        if !self.breaker.can_execute() {
            return Err(FetchError::CircuitOpen {
                consecutive_failures: self.breaker.failure_count(),
                last_error: "circuit still open from an earlier batch".to_string(),
            });
        }

        debug!(fetcher = %self.name, requested, "Starting batch fetch");

        for (index, symbol) in unique.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    completed: index,
                    requested,
                });
            }

            self.limiter.acquire().await;

            match fetch_one(symbol.clone()).await {
                Ok(payload) => {
                    self.breaker.record_success();
                    batch.entries.push((symbol.clone(), payload));
                }
                Err(err) => {
                    let transient = err.is_recoverable();
                    warn!(
                        fetcher = %self.name,
                        symbol = %symbol,
                        error = %err,
                        transient,
                        "Fetch failed, skipping symbol"
                    );

                    if transient && self.breaker.record_failure() {
                        return Err(FetchError::CircuitOpen {
                            consecutive_failures: self.breaker.failure_count(),
                            last_error: err.to_string(),
                        });
                    }

                    batch.failures.push(FetchFailure {
                        symbol: symbol.clone(),
                        error: err.to_string(),
                        transient,
                    });
                }
            }
        }

        info!(
            fetcher = %self.name,
            requested,
            fetched = batch.entries.len(),
            failed = batch.failures.len(),
            "Batch fetch complete"
        );

        Ok(batch)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fetcher(threshold: u32) -> BatchedFetcher {
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::with_name("test")
                .failure_threshold(threshold)
                .reset_timeout(Duration::from_secs(60)),
        ));
        BatchedFetcher::new("test", Duration::ZERO, breaker)
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_skips_data_failures_and_keeps_order() {
        let fetcher = fetcher(3);
        let input = symbols(&["C", "A", "BAD", "B"]);

        let batch = fetcher
            .fetch_batch(
                &input,
                |s| async move {
                    if s == "BAD" {
                        Err(ProviderError::DataNotAvailable(s))
                    } else {
                        Ok(s.len())
                    }
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.symbols().collect::<Vec<_>>(), vec!["C", "A", "B"]);
        assert_eq!(batch.failures().len(), 1);
        assert!(!batch.failures()[0].transient);
        assert_eq!(batch.get("A"), Some(&1));
        assert!(!batch.all_failed());
    }

    #[tokio::test]
    async fn test_duplicates_fetched_once() {
        let fetcher = fetcher(3);
        let calls = AtomicU32::new(0);
        let input = symbols(&["A", "B", "A"]);

        let batch = fetcher
            .fetch_batch(
                &input,
                |s| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async move { Ok::<_, ProviderError>(s) }
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.requested(), 2);
    }

    #[tokio::test]
    async fn test_all_data_failures_is_not_an_error() {
        let fetcher = fetcher(2);
        let input = symbols(&["A", "B", "C", "D"]);

        let batch = fetcher
            .fetch_batch(
                &input,
                |s| async move { Err::<(), _>(ProviderError::Malformed(s)) },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(batch.all_failed());
        assert_eq!(batch.failures().len(), 4);
    }

    #[tokio::test]
    async fn test_consecutive_transient_failures_open_circuit() {
        let fetcher = fetcher(2);
        let input = symbols(&["A", "B", "C"]);

        let err = fetcher
            .fetch_batch(
                &input,
                |_| async { Err::<(), _>(ProviderError::Network("refused".into())) },
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::CircuitOpen { consecutive_failures: 2, .. }));

        // Still open for the next batch
        let err = fetcher
            .fetch_batch(&input, |_| async { Ok::<_, ProviderError>(()) }, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_interleaved_success_resets_breaker() {
        let fetcher = fetcher(2);
        let input = symbols(&["X1", "OK1", "X2", "OK2", "X3"]);

        let batch = fetcher
            .fetch_batch(
                &input,
                |s| async move {
                    if s.starts_with('X') {
                        Err(ProviderError::Unavailable(s))
                    } else {
                        Ok(())
                    }
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.failures().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_between_symbols() {
        let fetcher = fetcher(3);
        let cancel = CancelToken::new();
        let input = symbols(&["A", "B", "C"]);

        let err = fetcher
            .fetch_batch(
                &input,
                |s| {
                    if s == "A" {
                        cancel.cancel();
                    }
                    async move { Ok::<_, ProviderError>(s) }
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Cancelled {
                completed: 1,
                requested: 3
            }
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let fetcher = fetcher(3);
        let batch = fetcher
            .fetch_batch(&[], |s| async move { Ok::<_, ProviderError>(s) }, &CancelToken::new())
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(!batch.all_failed());
    }
}
