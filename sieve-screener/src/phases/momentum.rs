//! Phase 2: regime-adaptive momentum.
//!
//! Gate thresholds follow the benchmark regime detected once per run;
//! weights stay fixed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::{MomentumConfig, MomentumThresholds};
use super::fetch_candles;
use crate::data::indicators::{closes, highest_high, pct_return, rsi, sma};
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::funnel::gate::{at_least, at_most, within};
use crate::funnel::{
    Normalization, Phase, Predicate, Regime, RegimeDetector, ScoreCard, ScoreComponent, StageSpec,
};

const ONE_MONTH: usize = 21;
const THREE_MONTHS: usize = 63;
const SIX_MONTHS: usize = 126;
const ONE_YEAR: usize = 252;
const RSI_PERIOD: usize = 14;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumMetrics {
    pub last_close: f64,
    pub return_1m: f64,
    pub return_3m: f64,
    pub return_6m: f64,
    /// Distance below the 52-week high (%)
    pub distance_from_high: f64,
    /// Stacked averages held: close > SMA20, SMA20 > SMA50, SMA50 > SMA200
    pub trend_alignment: f64,
    pub rsi: f64,
}

pub struct MomentumStage {
    provider: Arc<dyn MarketDataProvider>,
    config: MomentumConfig,
    detector: RegimeDetector,
}

impl MomentumStage {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        config: MomentumConfig,
        benchmark: &str,
        fallback: Regime,
    ) -> Self {
        let detector = RegimeDetector::new(provider.clone(), benchmark, fallback);
        Self {
            provider,
            config,
            detector,
        }
    }
}

fn trend_alignment(values: &[f64]) -> f64 {
    let Some(&close) = values.last() else {
        return 0.0;
    };
    let sma20 = sma(values, 20);
    let sma50 = sma(values, 50);
    let sma200 = sma(values, 200);

    let checks = [
        sma20.is_some_and(|s| close > s),
        matches!((sma20, sma50), (Some(a), Some(b)) if a > b),
        matches!((sma50, sma200), (Some(a), Some(b)) if a > b),
    ];
    checks.iter().filter(|held| **held).count() as f64
}

#[async_trait]
impl StageSpec for MomentumStage {
    type Payload = Vec<Candle>;
    type Metrics = MomentumMetrics;
    type Thresholds = MomentumThresholds;
    type Context = Regime;

    fn phase(&self) -> Phase {
        Phase::Momentum
    }

    fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.config.fetch_delay_ms)
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<Regime> {
        Ok(self.detector.detect().await)
    }

    async fn fetch_one(&self, symbol: &str, _regime: &Regime) -> Result<Vec<Candle>, ProviderError> {
        fetch_candles(self.provider.as_ref(), symbol, self.config.lookback_days).await
    }

    fn measure(&self, _symbol: &str, candles: &Vec<Candle>, _regime: &Regime) -> Option<MomentumMetrics> {
        let values = closes(candles);
        let last_close = *values.last()?;
        let high = highest_high(candles, ONE_YEAR)?;
        if high <= 0.0 {
            return None;
        }

        Some(MomentumMetrics {
            last_close,
            return_1m: pct_return(&values, ONE_MONTH)?,
            return_3m: pct_return(&values, THREE_MONTHS)?,
            return_6m: pct_return(&values, SIX_MONTHS)?,
            distance_from_high: ((high - last_close) / high * 100.0).max(0.0),
            trend_alignment: trend_alignment(&values),
            rsi: rsi(&values, RSI_PERIOD)?,
        })
    }

    fn components(&self) -> Vec<ScoreComponent<MomentumMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new("return_3m", w.return_3m, Normalization::Percentile, |m: &MomentumMetrics| {
                m.return_3m
            }),
            ScoreComponent::new("return_6m", w.return_6m, Normalization::Percentile, |m: &MomentumMetrics| {
                m.return_6m
            }),
            ScoreComponent::new("return_1m", w.return_1m, Normalization::MinMax, |m: &MomentumMetrics| {
                m.return_1m
            }),
            ScoreComponent::new(
                "distance_from_high",
                w.distance_from_high,
                Normalization::Inverse,
                |m: &MomentumMetrics| m.distance_from_high,
            ),
            ScoreComponent::new(
                "trend_alignment",
                w.trend_alignment,
                Normalization::Absolute { lo: 0.0, hi: 3.0 },
                |m: &MomentumMetrics| m.trend_alignment,
            ),
        ]
    }

    fn thresholds(&self, regime: &Regime) -> MomentumThresholds {
        self.config.thresholds.select(*regime).clone()
    }

    fn predicates(&self) -> Vec<Predicate<MomentumMetrics, MomentumThresholds>> {
        vec![
            Predicate::new("min_return_3m", |m: &MomentumMetrics, _: &ScoreCard, t: &MomentumThresholds| {
                at_least(m.return_3m, t.min_return_3m)
            }),
            Predicate::new("min_return_6m", |m: &MomentumMetrics, _: &ScoreCard, t: &MomentumThresholds| {
                at_least(m.return_6m, t.min_return_6m)
            }),
            Predicate::new("near_high", |m: &MomentumMetrics, _: &ScoreCard, t: &MomentumThresholds| {
                at_most(m.distance_from_high, t.max_distance_from_high)
            }),
            Predicate::new("rsi_band", |m: &MomentumMetrics, _: &ScoreCard, t: &MomentumThresholds| {
                within(m.rsi, t.rsi_min, t.rsi_max)
            }),
            Predicate::new("min_percentile", |_: &MomentumMetrics, c: &ScoreCard, t: &MomentumThresholds| {
                at_least(c.percentile_rank, t.min_percentile)
            }),
        ]
    }

    fn record_context(&self, regime: &Regime) -> serde_json::Value {
        serde_json::json!({ "regime": regime })
    }
}
