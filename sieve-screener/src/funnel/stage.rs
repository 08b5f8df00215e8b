//! Stage abstraction shared by every scored phase.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::gate::{GateResult, Predicate};
use super::scoring::{ComponentScore, ScoreCard, ScoreComponent};
use super::CancelToken;
use crate::data::ProviderError;

// ============================================================================
// Phase
// ============================================================================

/// Funnel phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Universe,
    Momentum,
    Consistency,
    Liquidity,
    Setup,
    Fundamentals,
    Risk,
    Portfolio,
    Recommendation,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Universe,
        Phase::Momentum,
        Phase::Consistency,
        Phase::Liquidity,
        Phase::Setup,
        Phase::Fundamentals,
        Phase::Risk,
        Phase::Portfolio,
        Phase::Recommendation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Universe => "universe",
            Phase::Momentum => "momentum",
            Phase::Consistency => "consistency",
            Phase::Liquidity => "liquidity",
            Phase::Setup => "setup",
            Phase::Fundamentals => "fundamentals",
            Phase::Risk => "risk",
            Phase::Portfolio => "portfolio",
            Phase::Recommendation => "recommendation",
        }
    }

    /// 1-based position in the funnel.
    pub fn number(&self) -> usize {
        Phase::ALL.iter().position(|p| p == self).map_or(0, |i| i + 1)
    }

    /// The phase feeding this one, if any.
    pub fn upstream(&self) -> Option<Phase> {
        let n = self.number();
        (n > 1).then(|| Phase::ALL[n - 2])
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str() == s.to_lowercase())
            .copied()
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

// ============================================================================
// Records
// ============================================================================

/// One persisted result row: a symbol's outcome in one phase run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub symbol: String,
    pub phase: Phase,
    pub run_id: String,
    pub run_at: DateTime<Utc>,
    /// Phase-specific raw metrics
    pub metrics: serde_json::Value,
    pub components: Vec<ComponentScore>,
    pub composite: f64,
    pub percentile_rank: f64,
    pub gates: Vec<GateResult>,
    pub filters_passed: usize,
    pub required_minimum: usize,
    pub qualifies: bool,
    /// Run-level context such as the detected regime
    #[serde(default)]
    pub context: serde_json::Value,
}

impl StageRecord {
    /// Decode the raw metrics back into the phase's metrics type.
    pub fn metrics_as<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(self.metrics.clone())
    }
}

/// A scored population member before gating.
#[derive(Debug, Clone)]
pub struct Scored<M> {
    pub symbol: String,
    pub metrics: M,
    pub card: ScoreCard,
}

// ============================================================================
// Invocation
// ============================================================================

/// Input to one stage invocation.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub run_id: String,
    /// Candidates handed over by the controller. `None` means the stage
    /// resolves its own input (standalone run).
    pub candidates: Option<Vec<String>>,
    pub cancel: CancelToken,
}

impl StageParams {
    pub fn standalone(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            candidates: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_candidates(run_id: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            run_id: run_id.into(),
            candidates: Some(candidates),
            cancel: CancelToken::new(),
        }
    }
}

/// Where a standalone run gets its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    /// Qualified records of the given phase, best first
    Upstream(Phase),
    /// The stage discovers candidates itself
    Discover,
}

// ============================================================================
// Stage Spec
// ============================================================================

/// Everything phase-specific about a scored stage.
///
/// The runner owns the pipeline (fetch, score, gate, persist); a spec
/// only supplies data access, metrics, weights and predicates.
#[async_trait]
pub trait StageSpec: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Metrics: Serialize + Send + Sync + 'static;
    type Thresholds: Serialize + Send + Sync + 'static;
    type Context: Send + Sync + 'static;

    fn phase(&self) -> Phase;

    fn candidate_source(&self) -> CandidateSource {
        match self.phase().upstream() {
            Some(upstream) => CandidateSource::Upstream(upstream),
            None => CandidateSource::Discover,
        }
    }

    /// Candidate discovery for `CandidateSource::Discover` stages.
    async fn discover(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    /// Delay between per-symbol fetches.
    fn fetch_delay(&self) -> Duration;

    fn required_minimum(&self) -> usize;

    /// Run-level setup before fetching (regime detection, upstream lookups).
    async fn prepare(&self, candidates: &[String]) -> anyhow::Result<Self::Context>;

    async fn fetch_one(&self, symbol: &str, ctx: &Self::Context) -> Result<Self::Payload, ProviderError>;

    /// Raw metrics for one symbol, `None` when the payload is unusable.
    fn measure(&self, symbol: &str, payload: &Self::Payload, ctx: &Self::Context) -> Option<Self::Metrics>;

    fn components(&self) -> Vec<ScoreComponent<Self::Metrics>>;

    fn thresholds(&self, ctx: &Self::Context) -> Self::Thresholds;

    fn predicates(&self) -> Vec<Predicate<Self::Metrics, Self::Thresholds>>;

    /// Population-level adjustment after scoring, before gating.
    fn after_scoring(&self, _scored: &mut [Scored<Self::Metrics>], _ctx: &Self::Context) {}

    /// Context copied into every record.
    fn record_context(&self, _ctx: &Self::Context) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_names() {
        assert_eq!(Phase::Universe.number(), 1);
        assert_eq!(Phase::Recommendation.number(), 9);
        assert_eq!(Phase::Universe.upstream(), None);
        assert_eq!(Phase::Momentum.upstream(), Some(Phase::Universe));
        assert_eq!(Phase::Recommendation.upstream(), Some(Phase::Portfolio));
        assert!(Phase::Setup < Phase::Risk);

        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("nope".parse::<Phase>().is_err());
        assert_eq!("Momentum".parse::<Phase>(), Ok(Phase::Momentum));
    }

    #[test]
    fn test_phase_serde() {
        let json = serde_json::to_string(&Phase::Fundamentals).unwrap();
        assert_eq!(json, "\"fundamentals\"");
    }
}
