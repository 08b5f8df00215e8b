//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};

use sieve_screener::data::{
    Candle, Instrument, MarketDataProvider, ProviderError, QuarterlyResult, ShareholdingPattern,
};

/// In-memory provider with canned series and per-symbol failures.
#[derive(Default)]
pub struct MockProvider {
    instruments: Vec<Instrument>,
    candles: HashMap<String, Vec<Candle>>,
    quarters: HashMap<String, Vec<QuarterlyResult>>,
    holdings: HashMap<String, ShareholdingPattern>,
    failing: HashSet<String>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(mut self, symbol: &str, series: &str, sector: Option<&str>) -> Self {
        self.instruments.push(Instrument {
            symbol: symbol.to_string(),
            name: format!("{symbol} Ltd"),
            exchange: "NSE".to_string(),
            series: series.to_string(),
            isin: None,
            sector: sector.map(str::to_string),
        });
        self
    }

    pub fn with_candles(mut self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.candles.insert(symbol.to_string(), candles);
        self
    }

    pub fn with_quarters(mut self, symbol: &str, quarters: Vec<QuarterlyResult>) -> Self {
        self.quarters.insert(symbol.to_string(), quarters);
        self
    }

    pub fn with_holding(mut self, symbol: &str, promoter_pct: f64, institutional_pct: f64) -> Self {
        self.holdings.insert(
            symbol.to_string(),
            ShareholdingPattern {
                as_of: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
                promoter_pct,
                pledged_pct: 0.0,
                institutional_pct,
                prev_institutional_pct: Some(institutional_pct - 0.5),
            },
        );
        self
    }

    /// Every call for `symbol` fails with a network error.
    pub fn failing(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, symbol: &str) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(symbol) {
            return Err(ProviderError::Network(format!("connection reset fetching {symbol}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.instruments.clone())
    }

    async fn get_daily_candles(&self, symbol: &str, lookback_days: usize) -> Result<Vec<Candle>, ProviderError> {
        self.check(symbol)?;
        let candles = self
            .candles
            .get(symbol)
            .ok_or_else(|| ProviderError::DataNotAvailable(format!("no candles for {symbol}")))?;
        let skip = candles.len().saturating_sub(lookback_days);
        Ok(candles[skip..].to_vec())
    }

    async fn get_quarterly_results(
        &self,
        symbol: &str,
        quarters: usize,
    ) -> Result<Vec<QuarterlyResult>, ProviderError> {
        self.check(symbol)?;
        Ok(self
            .quarters
            .get(symbol)
            .map(|q| q.iter().take(quarters).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_shareholding(&self, symbol: &str) -> Result<ShareholdingPattern, ProviderError> {
        self.check(symbol)?;
        self.holdings
            .get(symbol)
            .cloned()
            .ok_or_else(|| ProviderError::DataNotAvailable(format!("no shareholding for {symbol}")))
    }
}

/// Weekday bars from 2025-01-06 rising `daily_pct` a day.
pub fn trending(bars: usize, start_price: f64, daily_pct: f64, volume: f64) -> Vec<Candle> {
    let mut date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
    let mut close = start_price;
    let mut candles = Vec::with_capacity(bars);
    while candles.len() < bars {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            candles.push(Candle {
                date,
                open: close * 0.998,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume,
            });
            close *= 1.0 + daily_pct / 100.0;
        }
        date = date.succ_opt().unwrap();
    }
    candles
}

/// Quarterly results, newest first, with revenue growing `growth_pct` a quarter.
pub fn growing_quarters(count: usize, latest_revenue: f64, growth_pct: f64, margin_pct: f64) -> Vec<QuarterlyResult> {
    let mut period_end = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
    let mut revenue = latest_revenue;
    let mut quarters = Vec::with_capacity(count);
    for _ in 0..count {
        let operating_profit = revenue * margin_pct / 100.0;
        quarters.push(QuarterlyResult {
            period_end,
            revenue,
            operating_profit,
            net_profit: operating_profit * 0.7,
        });
        revenue /= 1.0 + growth_pct / 100.0;
        period_end = period_end - chrono::Duration::days(91);
    }
    quarters
}
