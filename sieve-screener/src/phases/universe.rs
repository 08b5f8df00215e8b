//! Phase 1: tradable universe.
//!
//! Candidates come from the instrument master. A symbol survives when it
//! trades in a sane price band, with enough turnover and history and
//! hardly any dead sessions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{UniverseConfig, UniverseThresholds};
use super::fetch_candles;
use crate::data::indicators::avg_turnover;
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::funnel::gate::{at_least, at_most, within};
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};

/// Bars averaged for daily turnover.
const TURNOVER_BARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseMetrics {
    pub last_close: f64,
    pub avg_turnover: f64,
    pub trading_days: usize,
    pub zero_volume_days: usize,
    #[serde(default)]
    pub sector: Option<String>,
}

pub struct UniverseStage {
    provider: Arc<dyn MarketDataProvider>,
    config: UniverseConfig,
}

impl UniverseStage {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: UniverseConfig) -> Self {
        Self { provider, config }
    }

    fn admits_series(&self, series: &str) -> bool {
        self.config.series.is_empty() || self.config.series.iter().any(|s| s.eq_ignore_ascii_case(series))
    }
}

#[async_trait]
impl StageSpec for UniverseStage {
    type Payload = Vec<Candle>;
    type Metrics = UniverseMetrics;
    type Thresholds = UniverseThresholds;
    /// Sector by symbol, from the instrument master
    type Context = HashMap<String, Option<String>>;

    fn phase(&self) -> Phase {
        Phase::Universe
    }

    async fn discover(&self) -> Result<Vec<String>, ProviderError> {
        let instruments = self.provider.list_instruments().await?;
        let excluded: HashSet<String> = self.config.exclude.iter().map(|s| s.to_uppercase()).collect();

        let symbols: Vec<String> = instruments
            .into_iter()
            .filter(|i| self.admits_series(&i.series))
            .filter(|i| !excluded.contains(&i.symbol.to_uppercase()))
            .map(|i| i.symbol)
            .collect();
        debug!(count = symbols.len(), "Universe candidates discovered");
        Ok(symbols)
    }

    fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.config.fetch_delay_ms)
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<Self::Context> {
        let instruments = self.provider.list_instruments().await?;
        Ok(instruments.into_iter().map(|i| (i.symbol, i.sector)).collect())
    }

    async fn fetch_one(&self, symbol: &str, _ctx: &Self::Context) -> Result<Vec<Candle>, ProviderError> {
        fetch_candles(self.provider.as_ref(), symbol, self.config.lookback_days).await
    }

    fn measure(&self, symbol: &str, candles: &Vec<Candle>, ctx: &Self::Context) -> Option<UniverseMetrics> {
        let last = candles.last()?;
        Some(UniverseMetrics {
            last_close: last.close,
            avg_turnover: avg_turnover(candles, TURNOVER_BARS)?,
            trading_days: candles.len(),
            zero_volume_days: candles.iter().filter(|c| c.volume <= 0.0).count(),
            sector: ctx.get(symbol).cloned().flatten(),
        })
    }

    fn components(&self) -> Vec<ScoreComponent<UniverseMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new("turnover", w.turnover, Normalization::Percentile, |m: &UniverseMetrics| m.avg_turnover),
            ScoreComponent::new(
                "history",
                w.history,
                Normalization::Absolute {
                    lo: 0.0,
                    hi: self.config.lookback_days as f64,
                },
                |m: &UniverseMetrics| m.trading_days as f64,
            ),
            ScoreComponent::new(
                "activity",
                w.activity,
                Normalization::InverseAbsolute { lo: 0.0, hi: 10.0 },
                |m: &UniverseMetrics| m.zero_volume_days as f64,
            ),
        ]
    }

    fn thresholds(&self, _ctx: &Self::Context) -> UniverseThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<UniverseMetrics, UniverseThresholds>> {
        vec![
            Predicate::new("price_band", |m: &UniverseMetrics, _: &ScoreCard, t: &UniverseThresholds| {
                within(m.last_close, t.min_price, t.max_price)
            }),
            Predicate::new("min_turnover", |m: &UniverseMetrics, _: &ScoreCard, t: &UniverseThresholds| {
                at_least(m.avg_turnover, t.min_avg_turnover)
            }),
            Predicate::new("min_history", |m: &UniverseMetrics, _: &ScoreCard, t: &UniverseThresholds| {
                m.trading_days >= t.min_trading_days
            }),
            Predicate::new(
                "max_zero_volume_days",
                |m: &UniverseMetrics, _: &ScoreCard, t: &UniverseThresholds| {
                    at_most(m.zero_volume_days as f64, t.max_zero_volume_days as f64)
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::gate::evaluate;
    use crate::phases::config::UNIVERSE_GATES;
    use crate::phases::testing::{trending, MockProvider};

    fn stage(provider: MockProvider, config: UniverseConfig) -> UniverseStage {
        UniverseStage::new(Arc::new(provider), config)
    }

    fn card() -> ScoreCard {
        ScoreCard {
            components: Vec::new(),
            composite: 50.0,
            percentile_rank: 50.0,
        }
    }

    #[tokio::test]
    async fn test_discover_filters_series_and_exclusions() {
        let provider = MockProvider::new()
            .with_instrument("INFY", "EQ", Some("IT"))
            .with_instrument("GOLDBEES", "ETF", None)
            .with_instrument("YESBANK", "eq", Some("Banks"))
            .with_instrument("TCS", "EQ", Some("IT"));
        let config = UniverseConfig {
            exclude: vec!["yesbank".to_string()],
            ..Default::default()
        };

        let symbols = stage(provider, config).discover().await.unwrap();
        assert_eq!(symbols, vec!["INFY".to_string(), "TCS".to_string()]);
    }

    #[tokio::test]
    async fn test_measure_carries_sector() {
        let mut candles = trending(60, 500.0, 0.1, 100_000.0);
        candles[10].volume = 0.0;
        let provider = MockProvider::new()
            .with_instrument("INFY", "EQ", Some("IT"))
            .with_candles("INFY", candles);
        let stage = stage(provider, UniverseConfig::default());

        let ctx = stage.prepare(&["INFY".to_string()]).await.unwrap();
        let payload = stage.fetch_one("INFY", &ctx).await.unwrap();
        let m = stage.measure("INFY", &payload, &ctx).unwrap();

        assert_eq!(m.trading_days, 60);
        assert_eq!(m.zero_volume_days, 1);
        assert_eq!(m.sector.as_deref(), Some("IT"));
        assert!(m.avg_turnover > 10_000_000.0);
    }

    #[test]
    fn test_gates() {
        let stage = stage(MockProvider::new(), UniverseConfig::default());
        let preds = stage.predicates();
        assert_eq!(preds.len(), UNIVERSE_GATES);
        let t = stage.thresholds(&HashMap::new());

        let good = UniverseMetrics {
            last_close: 500.0,
            avg_turnover: 50_000_000.0,
            trading_days: 60,
            zero_volume_days: 0,
            sector: None,
        };
        assert!(evaluate(&preds, &good, &card(), &t, 4).qualifies);

        let penny = UniverseMetrics {
            last_close: 5.0,
            zero_volume_days: 9,
            ..good
        };
        let outcome = evaluate(&preds, &penny, &card(), &t, 4);
        assert_eq!(outcome.filters_passed, 2);
        assert!(!outcome.qualifies);
    }

    #[tokio::test]
    async fn test_missing_series_is_data_error() {
        let stage = stage(MockProvider::new(), UniverseConfig::default());
        let err = stage.fetch_one("NOPE", &HashMap::new()).await.unwrap_err();
        assert!(!err.is_recoverable());
    }
}
