//! Phase 5: setup detection.
//!
//! Looks for a tight base under a recent pivot high: contracting ranges,
//! drying volume and price close to the pivot. Emits the entry zone and
//! stop that risk sizing builds on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::{SetupConfig, SetupThresholds};
use super::fetch_candles;
use crate::data::indicators::{atr, avg_volume, highest_high, lowest_low};
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::funnel::gate::at_most;
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};

const ATR_PERIOD: usize = 14;
const FAST_ATR: usize = 5;
const SLOW_ATR: usize = 20;
const DRY_UP_RECENT: usize = 5;
const DRY_UP_BASE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupMetrics {
    pub last_close: f64,
    pub pivot: f64,
    /// ATR(5) / ATR(20)
    pub range_contraction: f64,
    /// Average volume over 5 bars / 50 bars
    pub volume_dry_up: f64,
    pub atr: f64,
    pub atr_pct: f64,
    pub distance_to_pivot_pct: f64,
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop: f64,
    /// Stop distance below the entry zone (%)
    pub stop_pct: f64,
}

pub struct SetupStage {
    provider: Arc<dyn MarketDataProvider>,
    config: SetupConfig,
}

impl SetupStage {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: SetupConfig) -> Self {
        Self { provider, config }
    }

    fn volume_dry_up(candles: &[Candle]) -> Option<f64> {
        if candles.len() < DRY_UP_BASE {
            return None;
        }
        let recent = avg_volume(&candles[candles.len() - DRY_UP_RECENT..])?;
        let base = avg_volume(&candles[candles.len() - DRY_UP_BASE..])?;
        (base > 0.0).then(|| recent / base)
    }
}

#[async_trait]
impl StageSpec for SetupStage {
    type Payload = Vec<Candle>;
    type Metrics = SetupMetrics;
    type Thresholds = SetupThresholds;
    type Context = ();

    fn phase(&self) -> Phase {
        Phase::Setup
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

    fn measure(&self, _symbol: &str, candles: &Vec<Candle>, _ctx: &()) -> Option<SetupMetrics> {
        let last_close = candles.last()?.close;
        let pivot = highest_high(candles, self.config.pivot_bars)?;
        let atr_now = atr(candles, ATR_PERIOD)?;
        let slow = atr(candles, SLOW_ATR)?;
        if pivot <= 0.0 || last_close <= 0.0 || slow <= 0.0 {
            return None;
        }

        let entry_low = pivot;
        let entry_high = pivot * (1.0 + self.config.entry_buffer_pct / 100.0);
        let swing_low = lowest_low(candles, self.config.stop_lookback)?;
        let stop = swing_low.max(entry_low - self.config.stop_atr_multiple * atr_now);
        if stop >= entry_low {
            return None;
        }

        Some(SetupMetrics {
            last_close,
            pivot,
            range_contraction: atr(candles, FAST_ATR)? / slow,
            volume_dry_up: Self::volume_dry_up(candles)?,
            atr: atr_now,
            atr_pct: atr_now / last_close * 100.0,
            distance_to_pivot_pct: ((pivot - last_close) / pivot * 100.0).max(0.0),
            entry_low,
            entry_high,
            stop,
            stop_pct: (entry_low - stop) / entry_low * 100.0,
        })
    }

    fn components(&self) -> Vec<ScoreComponent<SetupMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new("contraction", w.contraction, Normalization::Inverse, |m: &SetupMetrics| {
                m.range_contraction
            }),
            ScoreComponent::new("dry_up", w.dry_up, Normalization::Inverse, |m: &SetupMetrics| {
                m.volume_dry_up
            }),
            ScoreComponent::new(
                "proximity",
                w.proximity,
                Normalization::InverseAbsolute { lo: 0.0, hi: 10.0 },
                |m: &SetupMetrics| m.distance_to_pivot_pct,
            ),
            ScoreComponent::new(
                "volatility",
                w.volatility,
                Normalization::InverseAbsolute { lo: 0.0, hi: 10.0 },
                |m: &SetupMetrics| m.atr_pct,
            ),
        ]
    }

    fn thresholds(&self, _ctx: &()) -> SetupThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<SetupMetrics, SetupThresholds>> {
        vec![
            Predicate::new("range_contraction", |m: &SetupMetrics, _: &ScoreCard, t: &SetupThresholds| {
                at_most(m.range_contraction, t.max_range_contraction)
            }),
            Predicate::new("volume_dry_up", |m: &SetupMetrics, _: &ScoreCard, t: &SetupThresholds| {
                at_most(m.volume_dry_up, t.max_volume_dry_up)
            }),
            Predicate::new("near_pivot", |m: &SetupMetrics, _: &ScoreCard, t: &SetupThresholds| {
                at_most(m.distance_to_pivot_pct, t.max_distance_to_pivot_pct)
            }),
            Predicate::new("max_atr_pct", |m: &SetupMetrics, _: &ScoreCard, t: &SetupThresholds| {
                at_most(m.atr_pct, t.max_atr_pct)
            }),
            Predicate::new("stop_within", |m: &SetupMetrics, _: &ScoreCard, t: &SetupThresholds| {
                at_most(m.stop_pct, t.max_stop_pct)
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::gate::evaluate;
    use crate::phases::config::SETUP_GATES;
    use crate::phases::testing::{trending, MockProvider};

    fn stage() -> SetupStage {
        SetupStage::new(Arc::new(MockProvider::new()), SetupConfig::default())
    }

    /// Wide swings, then a quiet, low-volume base just under the high.
    fn tight_base() -> Vec<Candle> {
        let mut candles = trending(60, 100.0, 0.0, 100_000.0);
        for (i, c) in candles.iter_mut().enumerate() {
            let (spread, volume) = if i < 50 { (0.04, 100_000.0) } else { (0.01, 40_000.0) };
            c.high = c.close * (1.0 + spread);
            c.low = c.close * (1.0 - spread);
            c.volume = volume;
        }
        candles
    }

    #[test]
    fn test_tight_base_levels() {
        let s = stage();
        let m = s.measure("X", &tight_base(), &()).unwrap();

        assert!(m.range_contraction < 0.9);
        assert!(m.volume_dry_up < 0.5);
        assert!(m.distance_to_pivot_pct < 5.0);
        assert!((m.entry_high / m.entry_low - 1.01).abs() < 1e-9);
        assert!(m.stop < m.entry_low);
        assert!(m.stop_pct > 0.0);

        let preds = s.predicates();
        assert_eq!(preds.len(), SETUP_GATES);
        let card = ScoreCard {
            components: Vec::new(),
            composite: 50.0,
            percentile_rank: 50.0,
        };
        assert!(evaluate(&preds, &m, &card, &s.thresholds(&()), 3).qualifies);
    }

    #[test]
    fn test_stop_never_above_entry() {
        let m = stage().measure("X", &trending(60, 100.0, 0.5, 100_000.0), &()).unwrap();
        assert!(m.stop < m.entry_low);
        assert!(m.stop >= m.entry_low - 1.5 * m.atr - 1e-9);
    }

    #[test]
    fn test_needs_fifty_bars_for_volume_base() {
        assert!(stage().measure("X", &trending(40, 100.0, 0.0, 1_000.0), &()).is_none());
    }
}
