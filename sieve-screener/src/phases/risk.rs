//! Phase 7: risk sizing.
//!
//! Turns each setup's zone and stop into concrete trade levels and a
//! position size from the fixed-fractional risk budget:
//! `shares = floor(capital × risk% / R)` where `R = entry − stop`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{RiskConfig, RiskThresholds};
use super::fetch_candles;
use super::setup::SetupMetrics;
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::execution::TradeLevels;
use crate::funnel::gate::{at_least, at_most};
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};
use crate::store::{QualificationStore, RecordFilter, RecordSort};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub last_close: f64,
    pub levels: TradeLevels,
    pub entry: f64,
    pub risk_per_share: f64,
    /// Stop distance as % of entry
    pub stop_pct: f64,
    pub shares: u64,
    pub position_value: f64,
    /// Position value as % of capital
    pub position_pct: f64,
    /// Money lost at the stop
    pub capital_at_risk: f64,
    /// Last close above the top of the entry zone (%)
    pub extension_pct: f64,
}

/// Position size for a risk budget. Zero when the stop is not below entry.
pub fn position_size(capital: f64, risk_pct: f64, entry: f64, stop: f64) -> u64 {
    let risk_per_share = entry - stop;
    if risk_per_share <= 0.0 || capital <= 0.0 || risk_pct <= 0.0 {
        return 0;
    }
    (capital * risk_pct / 100.0 / risk_per_share).floor() as u64
}

pub struct RiskStage {
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn QualificationStore>,
    config: RiskConfig,
    capital: f64,
    risk_per_trade_pct: f64,
}

impl RiskStage {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        store: Arc<dyn QualificationStore>,
        config: RiskConfig,
        capital: f64,
        risk_per_trade_pct: f64,
    ) -> Self {
        Self {
            provider,
            store,
            config,
            capital,
            risk_per_trade_pct,
        }
    }

    /// Levels and size for one setup at the latest close.
    pub fn size(&self, setup: &SetupMetrics, last_close: f64) -> Option<RiskMetrics> {
        let entry = (setup.entry_low + setup.entry_high) / 2.0;
        let risk_per_share = entry - setup.stop;
        if risk_per_share <= 0.0 || entry <= 0.0 {
            return None;
        }
        let shares = position_size(self.capital, self.risk_per_trade_pct, entry, setup.stop);
        let position_value = shares as f64 * entry;

        Some(RiskMetrics {
            last_close,
            levels: TradeLevels {
                entry_low: setup.entry_low,
                entry_high: setup.entry_high,
                stop: setup.stop,
                target_1: entry + self.config.target_1_r * risk_per_share,
                target_2: entry + self.config.target_2_r * risk_per_share,
            },
            entry,
            risk_per_share,
            stop_pct: risk_per_share / entry * 100.0,
            shares,
            position_value,
            position_pct: if self.capital > 0.0 {
                position_value / self.capital * 100.0
            } else {
                0.0
            },
            capital_at_risk: shares as f64 * risk_per_share,
            extension_pct: (last_close - setup.entry_high) / setup.entry_high * 100.0,
        })
    }
}

#[async_trait]
impl StageSpec for RiskStage {
    type Payload = Vec<Candle>;
    type Metrics = RiskMetrics;
    type Thresholds = RiskThresholds;
    /// Setup metrics by symbol
    type Context = HashMap<String, SetupMetrics>;

    fn phase(&self) -> Phase {
        Phase::Risk
    }

    fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.config.fetch_delay_ms)
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, candidates: &[String]) -> anyhow::Result<Self::Context> {
        let filter = RecordFilter {
            qualified_only: true,
            symbols: Some(candidates.to_vec()),
            ..Default::default()
        };
        let records = self
            .store
            .find_latest_per_identifier(Phase::Setup, &filter, RecordSort::Symbol)
            .await?;

        let mut setups = HashMap::with_capacity(records.len());
        for record in records {
            match record.metrics_as::<SetupMetrics>() {
                Ok(setup) => {
                    setups.insert(record.symbol, setup);
                }
                Err(e) => warn!(symbol = %record.symbol, error = %e, "Unreadable setup record"),
            }
        }
        debug!(candidates = candidates.len(), setups = setups.len(), "Loaded setups for sizing");
        Ok(setups)
    }

    async fn fetch_one(&self, symbol: &str, setups: &Self::Context) -> Result<Vec<Candle>, ProviderError> {
        if !setups.contains_key(symbol) {
            return Err(ProviderError::DataNotAvailable(format!("no qualified setup for {symbol}")));
        }
        fetch_candles(self.provider.as_ref(), symbol, self.config.lookback_days).await
    }

    fn measure(&self, symbol: &str, candles: &Vec<Candle>, setups: &Self::Context) -> Option<RiskMetrics> {
        let setup = setups.get(symbol)?;
        self.size(setup, candles.last()?.close)
    }

    fn components(&self) -> Vec<ScoreComponent<RiskMetrics>> {
        let w = &self.config.weights;
        let t = &self.config.thresholds;
        vec![
            ScoreComponent::new(
                "stop_tightness",
                w.stop_tightness,
                Normalization::InverseAbsolute {
                    lo: 0.0,
                    hi: t.max_stop_pct,
                },
                |m: &RiskMetrics| m.stop_pct,
            ),
            ScoreComponent::new(
                "extension",
                w.extension,
                Normalization::InverseAbsolute {
                    lo: 0.0,
                    hi: t.max_extension_pct * 2.0,
                },
                |m: &RiskMetrics| m.extension_pct,
            ),
            ScoreComponent::new(
                "capital_efficiency",
                w.capital_efficiency,
                Normalization::Absolute {
                    lo: 0.0,
                    hi: t.max_position_pct,
                },
                |m: &RiskMetrics| m.position_pct,
            ),
        ]
    }

    fn thresholds(&self, _setups: &Self::Context) -> RiskThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<RiskMetrics, RiskThresholds>> {
        vec![
            Predicate::new("max_stop_pct", |m: &RiskMetrics, _: &ScoreCard, t: &RiskThresholds| {
                at_most(m.stop_pct, t.max_stop_pct)
            }),
            Predicate::new("min_shares", |m: &RiskMetrics, _: &ScoreCard, t: &RiskThresholds| {
                m.shares >= t.min_shares.max(1)
            }),
            Predicate::new("max_position_pct", |m: &RiskMetrics, _: &ScoreCard, t: &RiskThresholds| {
                at_most(m.position_pct, t.max_position_pct)
            }),
            Predicate::new("not_extended", |m: &RiskMetrics, _: &ScoreCard, t: &RiskThresholds| {
                at_most(m.extension_pct, t.max_extension_pct)
            }),
        ]
    }
}
