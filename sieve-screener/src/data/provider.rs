//! Data provider abstraction.
//!
//! Defines the `MarketDataProvider` trait that every market data source
//! implements, and the error type the funnel uses to tell transient
//! infrastructure failures apart from per-symbol data problems.

use async_trait::async_trait;
use thiserror::Error;

use super::{Candle, FundamentalSnapshot, Instrument, QuarterlyResult, ShareholdingPattern};

// ============================================================================
// Provider Error
// ============================================================================

/// Errors specific to data providers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication error (invalid token, expired)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limit exceeded
    #[error("Rate limited{}", .retry_after_secs.map(|s| format!(", retry after {s} seconds")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// Data not available for the requested symbol
    #[error("Data not available: {0}")]
    DataNotAvailable(String),

    /// Provider is temporarily unavailable
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Response body could not be decoded
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Check if the error is recoverable (worth retrying).
    ///
    /// Recoverable errors count toward the fetcher's circuit breaker;
    /// the rest are per-symbol data failures.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Unavailable(_)
        )
    }
}

// ============================================================================
// Market Data Provider Trait
// ============================================================================

/// Trait for market data providers.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider name for logging (e.g., "http")
    fn name(&self) -> &str;

    /// Lightweight availability check.
    async fn health_check(&self) -> Result<(), ProviderError>;

    /// Full instrument master.
    async fn list_instruments(&self) -> Result<Vec<Instrument>, ProviderError>;

    /// Daily candles in chronological order, at most `lookback_days` of them.
    async fn get_daily_candles(
        &self,
        symbol: &str,
        lookback_days: usize,
    ) -> Result<Vec<Candle>, ProviderError>;

    /// Quarterly results, newest first.
    async fn get_quarterly_results(
        &self,
        symbol: &str,
        quarters: usize,
    ) -> Result<Vec<QuarterlyResult>, ProviderError>;

    /// Latest shareholding pattern.
    async fn get_shareholding(&self, symbol: &str) -> Result<ShareholdingPattern, ProviderError>;

    /// Quarterly results plus shareholding.
    ///
    /// Default implementation issues the two calls back to back.
    async fn get_fundamentals(
        &self,
        symbol: &str,
        quarters: usize,
    ) -> Result<FundamentalSnapshot, ProviderError> {
        let quarters = self.get_quarterly_results(symbol, quarters).await?;
        if quarters.is_empty() {
            return Err(ProviderError::DataNotAvailable(format!(
                "no quarterly results for {symbol}"
            )));
        }
        let shareholding = self.get_shareholding(symbol).await?;
        Ok(FundamentalSnapshot {
            quarters,
            shareholding,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_recoverable() {
        assert!(ProviderError::Network("timeout".into()).is_recoverable());
        assert!(ProviderError::RateLimited { retry_after_secs: Some(60) }.is_recoverable());
        assert!(ProviderError::Unavailable("maintenance".into()).is_recoverable());
        assert!(!ProviderError::Auth("invalid token".into()).is_recoverable());
        assert!(!ProviderError::DataNotAvailable("no data".into()).is_recoverable());
        assert!(!ProviderError::Malformed("bad json".into()).is_recoverable());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert!(err.to_string().contains("30 seconds"));

        let err = ProviderError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "Rate limited");

        let err = ProviderError::Network("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
