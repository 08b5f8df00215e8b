//! Phase 4: liquidity quality.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::config::{LiquidityConfig, LiquidityThresholds};
use super::fetch_candles;
use crate::data::indicators::{avg_volume, coefficient_of_variation};
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::funnel::gate::{at_least, at_most};
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};

/// Recent window for range and volume trend.
const RECENT_BARS: usize = 20;
const MIN_BARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityMetrics {
    pub avg_turnover: f64,
    pub turnover_cv: f64,
    /// Mean high-low range as % of close, a spread proxy
    pub avg_range_pct: f64,
    /// Recent average volume over the full-window average
    pub volume_trend: f64,
}

pub struct LiquidityStage {
    provider: Arc<dyn MarketDataProvider>,
    config: LiquidityConfig,
}

impl LiquidityStage {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: LiquidityConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl StageSpec for LiquidityStage {
    type Payload = Vec<Candle>;
    type Metrics = LiquidityMetrics;
    type Thresholds = LiquidityThresholds;
    type Context = ();

    fn phase(&self) -> Phase {
        Phase::Liquidity
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

    fn measure(&self, _symbol: &str, candles: &Vec<Candle>, _ctx: &()) -> Option<LiquidityMetrics> {
        if candles.len() < MIN_BARS {
            return None;
        }
        let turnover: Vec<f64> = candles.iter().map(Candle::turnover).collect();
        let recent = &candles[candles.len() - RECENT_BARS..];
        let full_volume = avg_volume(candles)?;
        if full_volume <= 0.0 {
            return None;
        }

        Some(LiquidityMetrics {
            avg_turnover: turnover.iter().mean(),
            turnover_cv: coefficient_of_variation(&turnover)?,
            avg_range_pct: recent.iter().map(Candle::range_pct).mean(),
            volume_trend: avg_volume(recent)? / full_volume,
        })
    }

    fn components(&self) -> Vec<ScoreComponent<LiquidityMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new("turnover", w.turnover, Normalization::Percentile, |m: &LiquidityMetrics| {
                m.avg_turnover
            }),
            ScoreComponent::new("stability", w.stability, Normalization::Inverse, |m: &LiquidityMetrics| {
                m.turnover_cv
            }),
            ScoreComponent::new(
                "spread",
                w.spread,
                Normalization::InverseAbsolute { lo: 0.0, hi: 10.0 },
                |m: &LiquidityMetrics| m.avg_range_pct,
            ),
            ScoreComponent::new(
                "volume_trend",
                w.volume_trend,
                Normalization::Absolute { lo: 0.5, hi: 1.5 },
                |m: &LiquidityMetrics| m.volume_trend,
            ),
        ]
    }

    fn thresholds(&self, _ctx: &()) -> LiquidityThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<LiquidityMetrics, LiquidityThresholds>> {
        vec![
            Predicate::new("min_turnover", |m: &LiquidityMetrics, _: &ScoreCard, t: &LiquidityThresholds| {
                at_least(m.avg_turnover, t.min_avg_turnover)
            }),
            Predicate::new(
                "turnover_stability",
                |m: &LiquidityMetrics, _: &ScoreCard, t: &LiquidityThresholds| {
                    at_most(m.turnover_cv, t.max_turnover_cv)
                },
            ),
            Predicate::new("tight_range", |m: &LiquidityMetrics, _: &ScoreCard, t: &LiquidityThresholds| {
                at_most(m.avg_range_pct, t.max_avg_range_pct)
            }),
            Predicate::new("volume_trend", |m: &LiquidityMetrics, _: &ScoreCard, t: &LiquidityThresholds| {
                at_least(m.volume_trend, t.min_volume_trend)
            }),
        ]
    }
}
