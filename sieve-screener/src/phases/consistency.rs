//! Phase 3: consistency of the advance.
//!
//! Prefers steady weekly gains, shallow drawdowns and a clean log-linear
//! trend over the last six months.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::{ConsistencyConfig, ConsistencyThresholds};
use super::fetch_candles;
use crate::data::indicators::{closes, log_trend_r2, max_drawdown_pct, stdev, weekly_returns};
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::funnel::gate::{at_least, at_most};
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};

const WINDOW_BARS: usize = 126;
const WINDOW_WEEKS: usize = 26;
const MIN_WEEKS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyMetrics {
    pub positive_weeks_pct: f64,
    /// Stdev of weekly returns (%)
    pub weekly_volatility: f64,
    pub max_drawdown_pct: f64,
    pub trend_r2: f64,
    pub weeks: usize,
}

pub struct ConsistencyStage {
    provider: Arc<dyn MarketDataProvider>,
    config: ConsistencyConfig,
}

impl ConsistencyStage {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: ConsistencyConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl StageSpec for ConsistencyStage {
    type Payload = Vec<Candle>;
    type Metrics = ConsistencyMetrics;
    type Thresholds = ConsistencyThresholds;
    type Context = ();

    fn phase(&self) -> Phase {
        Phase::Consistency
    }

    fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.config.fetch_delay_ms)
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_one(&self, symbol: &str, _ctx: &()) -> Result<Vec<Candle>, ProviderError> {
        fetch_candles(self.provider.as_ref(), symbol, self.config.lookback_days).await
    }

    fn measure(&self, _symbol: &str, candles: &Vec<Candle>, _ctx: &()) -> Option<ConsistencyMetrics> {
        let window = &candles[candles.len().saturating_sub(WINDOW_BARS)..];
        let weekly = weekly_returns(window);
        let weekly = &weekly[weekly.len().saturating_sub(WINDOW_WEEKS)..];
        if weekly.len() < MIN_WEEKS {
            return None;
        }
        let values = closes(window);
        let positive = weekly.iter().filter(|r| **r > 0.0).count();

        Some(ConsistencyMetrics {
            positive_weeks_pct: positive as f64 / weekly.len() as f64 * 100.0,
            weekly_volatility: stdev(weekly)?,
            max_drawdown_pct: max_drawdown_pct(&values),
            trend_r2: log_trend_r2(&values)?,
            weeks: weekly.len(),
        })
    }

    fn components(&self) -> Vec<ScoreComponent<ConsistencyMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new(
                "positive_weeks",
                w.positive_weeks,
                Normalization::MinMax,
                |m: &ConsistencyMetrics| m.positive_weeks_pct,
            ),
            ScoreComponent::new(
                "weekly_volatility",
                w.weekly_volatility,
                Normalization::Inverse,
                |m: &ConsistencyMetrics| m.weekly_volatility,
            ),
            ScoreComponent::new("drawdown", w.drawdown, Normalization::Inverse, |m: &ConsistencyMetrics| {
                m.max_drawdown_pct
            }),
            ScoreComponent::new(
                "trend_quality",
                w.trend_quality,
                Normalization::Percentile,
                |m: &ConsistencyMetrics| m.trend_r2,
            ),
        ]
    }

    fn thresholds(&self, _ctx: &()) -> ConsistencyThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<ConsistencyMetrics, ConsistencyThresholds>> {
        vec![
            Predicate::new(
                "positive_weeks",
                |m: &ConsistencyMetrics, _: &ScoreCard, t: &ConsistencyThresholds| {
                    at_least(m.positive_weeks_pct, t.min_positive_weeks_pct)
                },
            ),
            Predicate::new(
                "weekly_volatility",
                |m: &ConsistencyMetrics, _: &ScoreCard, t: &ConsistencyThresholds| {
                    at_most(m.weekly_volatility, t.max_weekly_volatility)
                },
            ),
            Predicate::new(
                "max_drawdown",
                |m: &ConsistencyMetrics, _: &ScoreCard, t: &ConsistencyThresholds| {
                    at_most(m.max_drawdown_pct, t.max_drawdown_pct)
                },
            ),
            Predicate::new(
                "trend_quality",
                |m: &ConsistencyMetrics, _: &ScoreCard, t: &ConsistencyThresholds| {
                    at_least(m.trend_r2, t.min_trend_r2)
                },
            ),
        ]
    }
}
