//! HTTP market data provider.
//!
//! Talks to a JSON market data gateway. Paths come from `ProviderConfig`,
//! with `{symbol}` substituted per request. Compressed responses
//! (the instrument master is served gzip-encoded) are decoded by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sieve_common::config::ProviderConfig;
use tracing::debug;

use super::{Candle, Instrument, MarketDataProvider, ProviderError, QuarterlyResult, ShareholdingPattern};

const RATE_LIMIT_RETRY_SECS: u64 = 60;

/// Market data provider backed by a JSON HTTP gateway.
pub struct HttpMarketDataProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpMarketDataProvider {
    /// Create a provider from configuration.
    pub fn new(config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, client }
    }

    fn url(&self, path: &str, symbol: Option<&str>) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = match symbol {
            Some(symbol) => path.replace("{symbol}", symbol),
            None => path.to_string(),
        };
        format!("{base}{path}")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        subject: &str,
    ) -> Result<T, ProviderError> {
        debug!(url = %url, subject = %subject, "Fetching from market data gateway");

        let mut request = self
            .client
            .get(url)
            .header("accept", "application/json")
            .query(query);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Network("Request timeout".into())
            } else if e.is_connect() {
                ProviderError::Network("Connection failed".into())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        if let Some(err) = status_error(response.status(), subject) {
            return Err(err);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Network(format!("Failed to read body: {e}")))?;

        serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("{subject}: {e}")))
    }
}

/// Map a non-success HTTP status to a provider error.
fn status_error(status: StatusCode, subject: &str) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }

    Some(match status {
        StatusCode::NOT_FOUND => ProviderError::DataNotAvailable(subject.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("HTTP {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_secs: Some(RATE_LIMIT_RETRY_SECS),
        },
        s if s.is_server_error() => ProviderError::Unavailable(format!("HTTP {s}")),
        s => ProviderError::InvalidRequest(format!("HTTP {s} for {subject}")),
    })
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = self.url("/health", None);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        match status_error(response.status(), "health") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, ProviderError> {
        let url = self.url(&self.config.instruments_path, None);
        self.get_json(&url, &[], "instruments").await
    }

    async fn get_daily_candles(
        &self,
        symbol: &str,
        lookback_days: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let url = self.url(&self.config.candles_path, Some(symbol));
        let mut candles: Vec<Candle> = self
            .get_json(&url, &[("days", lookback_days.to_string())], symbol)
            .await?;

        if candles.is_empty() {
            return Err(ProviderError::DataNotAvailable(format!("no candles for {symbol}")));
        }

        candles.sort_by_key(|c| c.date);
        if candles.len() > lookback_days {
            candles.drain(..candles.len() - lookback_days);
        }
        Ok(candles)
    }

    async fn get_quarterly_results(
        &self,
        symbol: &str,
        quarters: usize,
    ) -> Result<Vec<QuarterlyResult>, ProviderError> {
        let url = self.url(&self.config.results_path, Some(symbol));
        let mut results: Vec<QuarterlyResult> = self
            .get_json(&url, &[("quarters", quarters.to_string())], symbol)
            .await?;

        results.sort_by(|a, b| b.period_end.cmp(&a.period_end));
        results.truncate(quarters);
        Ok(results)
    }

    async fn get_shareholding(&self, symbol: &str) -> Result<ShareholdingPattern, ProviderError> {
        let url = self.url(&self.config.shareholding_path, Some(symbol));
        self.get_json(&url, &[], symbol).await
    }
}

// ============================================================================
// Tests
// ============================================================================
