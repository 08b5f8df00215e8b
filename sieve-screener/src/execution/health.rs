//! Aggregate view of funnel output and open trades.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::position::{Position, PositionStatus};
use super::recommendation::{Recommendation, RecommendationStatus};
use crate::funnel::Phase;
use crate::store::{PhaseSummary, RunAuditEntry, RunKind};

/// Summary of the most recent funnel run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: String,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
}

impl LastRun {
    /// Latest funnel entry among audit rows (newest first).
    pub fn from_audit(entries: &[RunAuditEntry]) -> Option<Self> {
        let entry = entries.iter().find(|e| e.kind == RunKind::Funnel)?;
        let failed_phase = entry
            .document
            .get("failed_phase")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let error = entry
            .document
            .get("error")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(Self {
            run_id: entry.run_id.clone(),
            success: entry.success,
            recorded_at: entry.recorded_at,
            failed_phase,
            error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub generated_at: DateTime<Utc>,
    pub positions_by_status: BTreeMap<String, usize>,
    pub recommendations_by_status: BTreeMap<String, usize>,
    /// Share of decided trades that made money, as a percentage
    pub win_rate: Option<f64>,
    pub realized_r: f64,
    pub open_risk: f64,
    pub last_funnel_run: Option<LastRun>,
    pub phases: Vec<PhaseSummary>,
}

impl SystemHealth {
    pub fn compute(
        positions: &[Position],
        recommendations: &[Recommendation],
        last_funnel_run: Option<LastRun>,
        phases: Vec<PhaseSummary>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut positions_by_status: BTreeMap<String, usize> = PositionStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for p in positions {
            *positions_by_status.entry(p.status.as_str().to_string()).or_default() += 1;
        }

        let mut recommendations_by_status: BTreeMap<String, usize> = RecommendationStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for r in recommendations {
            *recommendations_by_status
                .entry(r.status.as_str().to_string())
                .or_default() += 1;
        }

        let outcomes: Vec<f64> = positions.iter().filter_map(Position::realized_r).collect();
        let wins = outcomes.iter().filter(|r| **r > 0.0).count();
        let win_rate = (!outcomes.is_empty()).then(|| wins as f64 / outcomes.len() as f64 * 100.0);

        Self {
            generated_at: now,
            positions_by_status,
            recommendations_by_status,
            win_rate,
            realized_r: outcomes.iter().sum(),
            open_risk: positions.iter().map(Position::open_risk).sum(),
            last_funnel_run,
            phases,
        }
    }
}
