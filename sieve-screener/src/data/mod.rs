//! Market data layer.
//!
//! Provides the provider abstraction, an HTTP provider, a fixed-interval
//! pacer, the batched fetcher used by every funnel phase, and the
//! technical indicators computed from daily candles.

mod fetcher;
mod http;
pub mod indicators;
mod provider;
mod rate_limiter;

pub use fetcher::{BatchedFetcher, FetchError, FetchFailure, FetchedBatch};
pub use http::HttpMarketDataProvider;
pub use provider::{MarketDataProvider, ProviderError};
pub use rate_limiter::RateLimiter;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Data Types
// ============================================================================

/// An entry of the exchange instrument master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Trading symbol (e.g., "RELIANCE")
    pub symbol: String,
    /// Company name
    #[serde(default)]
    pub name: String,
    /// Exchange code
    #[serde(default)]
    pub exchange: String,
    /// Trading series (e.g., "EQ")
    #[serde(default)]
    pub series: String,
    #[serde(default)]
    pub isin: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
}

/// One daily OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Traded value of the bar (close × volume).
    pub fn turnover(&self) -> f64 {
        self.close * self.volume
    }

    /// High-low range as a percentage of close.
    pub fn range_pct(&self) -> f64 {
        if self.close == 0.0 {
            0.0
        } else {
            (self.high - self.low) / self.close * 100.0
        }
    }
}

/// One reported quarter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlyResult {
    pub period_end: NaiveDate,
    pub revenue: f64,
    pub operating_profit: f64,
    pub net_profit: f64,
}

impl QuarterlyResult {
    /// Operating margin (%). Zero when revenue is zero.
    pub fn operating_margin(&self) -> f64 {
        if self.revenue == 0.0 {
            0.0
        } else {
            self.operating_profit / self.revenue * 100.0
        }
    }
}

/// Latest shareholding disclosure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareholdingPattern {
    pub as_of: NaiveDate,
    /// Promoter holding (%)
    pub promoter_pct: f64,
    /// Share of promoter holding that is pledged (%)
    #[serde(default)]
    pub pledged_pct: f64,
    /// Institutional holding this quarter (%)
    #[serde(default)]
    pub institutional_pct: f64,
    /// Institutional holding last quarter (%)
    #[serde(default)]
    pub prev_institutional_pct: Option<f64>,
}

/// Quarterly results plus shareholding, fetched together per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalSnapshot {
    /// Newest first
    pub quarters: Vec<QuarterlyResult>,
    pub shareholding: ShareholdingPattern,
}
