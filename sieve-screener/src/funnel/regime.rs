//! Market regime detection and regime-keyed thresholds.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::indicators::{closes, sma};
use crate::data::{Candle, MarketDataProvider};

/// Broad market trend, read off a benchmark index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Close above a rising 50/200 stack
    Bullish,
    /// Neither stack holds
    #[default]
    Sideways,
    /// Close below a falling 50/200 stack
    Bearish,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::Bullish => "bullish",
            Regime::Sideways => "sideways",
            Regime::Bearish => "bearish",
        };
        f.write_str(s)
    }
}

/// Classify benchmark candles. `None` without 200 bars of history.
pub fn classify_regime(candles: &[Candle]) -> Option<Regime> {
    let values = closes(candles);
    let close = *values.last()?;
    let sma50 = sma(&values, 50)?;
    let sma200 = sma(&values, 200)?;

    Some(if close > sma50 && sma50 > sma200 {
        Regime::Bullish
    } else if close < sma50 && sma50 < sma200 {
        Regime::Bearish
    } else {
        Regime::Sideways
    })
}

/// One threshold set per regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeThresholds<T> {
    pub bullish: T,
    pub sideways: T,
    pub bearish: T,
}

impl<T> RegimeThresholds<T> {
    pub fn select(&self, regime: Regime) -> &T {
        match regime {
            Regime::Bullish => &self.bullish,
            Regime::Sideways => &self.sideways,
            Regime::Bearish => &self.bearish,
        }
    }
}

/// Fetches the benchmark and classifies it, falling back on failure.
pub struct RegimeDetector {
    provider: Arc<dyn MarketDataProvider>,
    benchmark: String,
    fallback: Regime,
}

impl RegimeDetector {
    /// Bars requested for detection; covers the 200-day average.
    pub const LOOKBACK_DAYS: usize = 260;

    pub fn new(provider: Arc<dyn MarketDataProvider>, benchmark: impl Into<String>, fallback: Regime) -> Self {
        Self {
            provider,
            benchmark: benchmark.into(),
            fallback,
        }
    }

    pub async fn detect(&self) -> Regime {
        let candles = match self
            .provider
            .get_daily_candles(&self.benchmark, Self::LOOKBACK_DAYS)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!(
                    benchmark = %self.benchmark,
                    error = %e,
                    fallback = %self.fallback,
                    "Regime detection failed, using fallback"
                );
                return self.fallback;
            }
        };

        match classify_regime(&candles) {
            Some(regime) => {
                info!(benchmark = %self.benchmark, regime = %regime, "Market regime detected");
                regime
            }
            None => {
                warn!(
                    benchmark = %self.benchmark,
                    bars = candles.len(),
                    fallback = %self.fallback,
                    "Not enough benchmark history, using fallback regime"
                );
                self.fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candles(closes: impl Iterator<Item = f64>) -> Vec<Candle> {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        closes
            .enumerate()
            .map(|(i, close)| Candle {
                date: start + chrono::Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_classify() {
        let rising = candles((0..220).map(|i| 100.0 + i as f64));
        assert_eq!(classify_regime(&rising), Some(Regime::Bullish));

        let falling = candles((0..220).map(|i| 400.0 - i as f64));
        assert_eq!(classify_regime(&falling), Some(Regime::Bearish));

        let flat = candles((0..220).map(|_| 100.0));
        assert_eq!(classify_regime(&flat), Some(Regime::Sideways));

        let short = candles((0..100).map(|i| i as f64));
        assert_eq!(classify_regime(&short), None);
    }

    #[test]
    fn test_select_thresholds() {
        let t = RegimeThresholds {
            bullish: 1,
            sideways: 2,
            bearish: 3,
        };
        assert_eq!(*t.select(Regime::Bearish), 3);
        assert_eq!(*t.select(Regime::default()), 2);
    }
}
