//! Phase 8: portfolio construction.
//!
//! Blends each candidate's upstream composites into one score, then
//! admits candidates greedily in rank order while the book has room:
//! a cap on positions, on names per sector and on deployed capital.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::PortfolioConfig;
use super::risk::RiskMetrics;
use crate::data::ProviderError;
use crate::execution::TradeLevels;
use crate::funnel::gate::at_least;
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, Scored, StageRecord, StageSpec};
use crate::store::{QualificationStore, RecordFilter, RecordSort};

/// Everything portfolio construction needs about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioInput {
    pub blended_score: f64,
    pub levels: TradeLevels,
    pub shares: u64,
    pub position_value: f64,
    pub sector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub blended_score: f64,
    pub levels: TradeLevels,
    pub shares: u64,
    pub position_value: f64,
    pub sector: Option<String>,
    /// Set by greedy admission
    pub admitted: bool,
    /// Why a candidate was left out
    #[serde(default)]
    pub excluded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioThresholds {
    pub min_blended_score: f64,
}

pub struct PortfolioStage {
    store: Arc<dyn QualificationStore>,
    config: PortfolioConfig,
    capital: f64,
}

impl PortfolioStage {
    pub fn new(store: Arc<dyn QualificationStore>, config: PortfolioConfig, capital: f64) -> Self {
        Self {
            store,
            config,
            capital,
        }
    }

    fn blend_weights(&self) -> [(Phase, f64); 6] {
        let b = &self.config.blend;
        [
            (Phase::Momentum, b.momentum),
            (Phase::Consistency, b.consistency),
            (Phase::Liquidity, b.liquidity),
            (Phase::Setup, b.setup),
            (Phase::Fundamentals, b.fundamentals),
            (Phase::Risk, b.risk),
        ]
    }

    async fn latest(&self, phase: Phase, filter: &RecordFilter) -> anyhow::Result<HashMap<String, StageRecord>> {
        let records = self
            .store
            .find_latest_per_identifier(phase, filter, RecordSort::Symbol)
            .await?;
        Ok(records.into_iter().map(|r| (r.symbol.clone(), r)).collect())
    }

    /// Greedy admission over a scored population.
    pub fn admit(&self, scored: &mut [Scored<PortfolioMetrics>]) {
        let mut order: Vec<usize> = (0..scored.len()).collect();
        order.sort_by(|&a, &b| {
            scored[b]
                .card
                .composite
                .partial_cmp(&scored[a].card.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let budget = self.capital * self.config.max_capital_pct / 100.0;
        let mut deployed = 0.0;
        let mut admitted = 0;
        let mut per_sector: HashMap<String, usize> = HashMap::new();

        for idx in order {
            let m = &mut scored[idx].metrics;
            let reason = if m.blended_score < self.config.min_blended_score {
                Some("min_blended_score")
            } else if admitted >= self.config.max_positions {
                Some("max_positions")
            } else if m
                .sector
                .as_ref()
                .is_some_and(|s| per_sector.get(s).copied().unwrap_or(0) >= self.config.max_per_sector)
            {
                Some("sector_cap")
            } else if deployed + m.position_value > budget {
                Some("capital_cap")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    m.admitted = false;
                    m.excluded_by = Some(reason.to_string());
                }
                None => {
                    m.admitted = true;
                    m.excluded_by = None;
                    admitted += 1;
                    deployed += m.position_value;
                    if let Some(sector) = &m.sector {
                        *per_sector.entry(sector.clone()).or_default() += 1;
                    }
                }
            }
        }
        info!(admitted, deployed, budget, "Portfolio admission complete");
    }
}

#[async_trait]
impl StageSpec for PortfolioStage {
    type Payload = PortfolioInput;
    type Metrics = PortfolioMetrics;
    type Thresholds = PortfolioThresholds;
    type Context = HashMap<String, PortfolioInput>;

    fn phase(&self) -> Phase {
        Phase::Portfolio
    }

    fn fetch_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, candidates: &[String]) -> anyhow::Result<Self::Context> {
        let filter = RecordFilter {
            symbols: Some(candidates.to_vec()),
            ..Default::default()
        };

        let mut by_phase = Vec::new();
        for (phase, weight) in self.blend_weights() {
            by_phase.push((self.latest(phase, &filter).await?, weight));
        }
        let risk = self.latest(Phase::Risk, &filter).await?;
        let universe = self.latest(Phase::Universe, &filter).await?;

        let mut inputs = HashMap::with_capacity(candidates.len());
        for symbol in candidates {
            let Some(sizing) = risk.get(symbol).and_then(|r| r.metrics_as::<RiskMetrics>().ok()) else {
                debug!(symbol = %symbol, "No risk sizing, skipping");
                continue;
            };

            let (mut weighted, mut total) = (0.0, 0.0);
            for (records, weight) in &by_phase {
                if let Some(record) = records.get(symbol) {
                    weighted += record.composite * weight;
                    total += weight;
                }
            }
            if total <= 0.0 {
                continue;
            }

            let sector = universe
                .get(symbol)
                .and_then(|r| r.metrics.get("sector"))
                .and_then(|s| s.as_str())
                .map(str::to_string);

            inputs.insert(
                symbol.clone(),
                PortfolioInput {
                    blended_score: weighted / total,
                    levels: sizing.levels,
                    shares: sizing.shares,
                    position_value: sizing.position_value,
                    sector,
                },
            );
        }
        Ok(inputs)
    }

    async fn fetch_one(&self, symbol: &str, inputs: &Self::Context) -> Result<PortfolioInput, ProviderError> {
        inputs
            .get(symbol)
            .cloned()
            .ok_or_else(|| ProviderError::DataNotAvailable(format!("no upstream records for {symbol}")))
    }

    fn measure(&self, _symbol: &str, input: &PortfolioInput, _inputs: &Self::Context) -> Option<PortfolioMetrics> {
        Some(PortfolioMetrics {
            blended_score: input.blended_score,
            levels: input.levels,
            shares: input.shares,
            position_value: input.position_value,
            sector: input.sector.clone(),
            admitted: false,
            excluded_by: None,
        })
    }

    fn components(&self) -> Vec<ScoreComponent<PortfolioMetrics>> {
        vec![ScoreComponent::new(
            "blended",
            1.0,
            Normalization::Absolute { lo: 0.0, hi: 100.0 },
            |m: &PortfolioMetrics| m.blended_score,
        )]
    }

    fn thresholds(&self, _inputs: &Self::Context) -> PortfolioThresholds {
        PortfolioThresholds {
            min_blended_score: self.config.min_blended_score,
        }
    }

    fn predicates(&self) -> Vec<Predicate<PortfolioMetrics, PortfolioThresholds>> {
        vec![
            Predicate::new("admitted", |m: &PortfolioMetrics, _: &ScoreCard, _: &PortfolioThresholds| {
                m.admitted
            }),
            Predicate::new(
                "min_blended_score",
                |m: &PortfolioMetrics, _: &ScoreCard, t: &PortfolioThresholds| {
                    at_least(m.blended_score, t.min_blended_score)
                },
            ),
        ]
    }

    fn after_scoring(&self, scored: &mut [Scored<PortfolioMetrics>], _inputs: &Self::Context) {
        self.admit(scored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CardFields;
    use crate::funnel::scoring::score_population;
    use crate::store::SqliteStore;
    use chrono::Utc;

    const LEVELS: TradeLevels = TradeLevels {
        entry_low: 100.0,
        entry_high: 102.0,
        stop: 96.0,
        target_1: 111.0,
        target_2: 116.0,
    };

    fn scored(symbol: &str, blended: f64, sector: &str, value: f64) -> Scored<PortfolioMetrics> {
        let metrics = PortfolioMetrics {
            blended_score: blended,
            levels: LEVELS,
            shares: 100,
            position_value: value,
            sector: Some(sector.to_string()),
            admitted: false,
            excluded_by: None,
        };
        let card = score_population(std::slice::from_ref(&metrics), &stage_with(PortfolioConfig::default()).components())
            .remove(0);
        Scored {
            symbol: symbol.to_string(),
            metrics,
            card,
        }
    }

    fn stage_with(config: PortfolioConfig) -> PortfolioStage {
        PortfolioStage::new(Arc::new(SqliteStore::in_memory().unwrap()), config, 1_000_000.0)
    }

    #[test]
    fn test_greedy_admission_respects_caps() {
        let stage = stage_with(PortfolioConfig {
            max_positions: 3,
            max_per_sector: 1,
            max_capital_pct: 50.0,
            ..Default::default()
        });
        let mut population = vec![
            scored("LOW", 40.0, "Energy", 10_000.0),
            scored("IT2", 80.0, "IT", 100_000.0),
            scored("IT1", 90.0, "IT", 100_000.0),
            scored("BANK", 70.0, "Banks", 350_000.0),
            scored("AUTO", 65.0, "Auto", 100_000.0),
            scored("PHARMA", 60.0, "Pharma", 50_000.0),
        ];
        stage.admit(&mut population);

        let status: HashMap<&str, (bool, Option<&str>)> = population
            .iter()
            .map(|s| (s.symbol.as_str(), (s.metrics.admitted, s.metrics.excluded_by.as_deref())))
            .collect();
        assert_eq!(status["IT1"], (true, None));
        assert_eq!(status["IT2"], (false, Some("sector_cap")));
        assert_eq!(status["BANK"], (true, None));
        // 450k of a 500k budget is deployed
        assert_eq!(status["AUTO"], (false, Some("capital_cap")));
        assert_eq!(status["PHARMA"], (true, None));
        assert_eq!(status["LOW"], (false, Some("min_blended_score")));
    }

    #[test]
    fn test_max_positions() {
        let stage = stage_with(PortfolioConfig {
            max_positions: 1,
            ..Default::default()
        });
        let mut population = vec![scored("A", 70.0, "X", 1.0), scored("B", 75.0, "Y", 1.0)];
        stage.admit(&mut population);
        assert!(!population[0].metrics.admitted);
        assert_eq!(population[0].metrics.excluded_by.as_deref(), Some("max_positions"));
        assert!(population[1].metrics.admitted);
    }

    fn record(symbol: &str, phase: Phase, composite: f64, metrics: serde_json::Value) -> StageRecord {
        StageRecord {
            symbol: symbol.to_string(),
            phase,
            run_id: format!("run:{phase}"),
            run_at: Utc::now(),
            metrics,
            components: Vec::new(),
            composite,
            percentile_rank: 100.0,
            gates: Vec::new(),
            filters_passed: 1,
            required_minimum: 1,
            qualifies: true,
            context: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_prepare_blends_available_phases() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let risk = serde_json::json!({
            "last_close": 99.0,
            "levels": LEVELS,
            "entry": 101.0,
            "risk_per_share": 5.0,
            "stop_pct": 4.95,
            "shares": 2000,
            "position_value": 202000.0,
            "position_pct": 20.2,
            "capital_at_risk": 10000.0,
            "extension_pct": -2.9
        });
        store
            .replace_all(Phase::Risk, "r", &[record("INFY", Phase::Risk, 80.0, risk)])
            .await
            .unwrap();
        store
            .replace_all(
                Phase::Momentum,
                "m",
                &[record("INFY", Phase::Momentum, 60.0, serde_json::json!({}))],
            )
            .await
            .unwrap();
        store
            .replace_all(
                Phase::Universe,
                "u",
                &[record("INFY", Phase::Universe, 50.0, serde_json::json!({ "sector": "IT" }))],
            )
            .await
            .unwrap();

        let stage = PortfolioStage::new(store, PortfolioConfig::default(), 1_000_000.0);
        let inputs = stage.prepare(&["INFY".to_string(), "TCS".to_string()]).await.unwrap();
        assert_eq!(inputs.len(), 1);

        let infy = &inputs["INFY"];
        // momentum 0.25 × 60 and risk 0.15 × 80, renormalised over 0.40
        assert!((infy.blended_score - 67.5).abs() < 1e-9);
        assert_eq!(infy.sector.as_deref(), Some("IT"));
        assert_eq!(infy.shares, 2000);

        // Portfolio metrics carry what a recommendation card needs
        let m = stage.measure("INFY", infy, &inputs).unwrap();
        let fields: CardFields = serde_json::from_value(serde_json::to_value(&m).unwrap()).unwrap();
        assert_eq!(fields.levels, LEVELS);
        assert_eq!(fields.shares, 2000);
    }
}
