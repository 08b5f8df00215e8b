//! Qualification store.
//!
//! Holds, per phase, the current generation of stage records plus the
//! run audit trail. Each phase is the only writer of its own records and
//! replaces them wholesale; readers only ever see a complete generation.

mod sqlite;

pub use sqlite::{PhaseSummary, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::funnel::{Phase, StageRecord};

// ============================================================================
// Queries
// ============================================================================

/// Row filter for record reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Only records whose gate passed
    #[serde(default)]
    pub qualified_only: bool,
    /// Restrict to these symbols
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub min_composite: Option<f64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn qualified() -> Self {
        Self {
            qualified_only: true,
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result ordering for record reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSort {
    /// Best composite first, ties by symbol
    #[default]
    CompositeDesc,
    PercentileDesc,
    Symbol,
}

// ============================================================================
// Run Audit
// ============================================================================

/// What produced an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Stage,
    Funnel,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Stage => "stage",
            RunKind::Funnel => "funnel",
        }
    }
}

/// One stored stage or funnel result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAuditEntry {
    pub run_id: String,
    pub kind: RunKind,
    pub phase: Option<Phase>,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
    /// The full serialized result
    pub document: serde_json::Value,
}

impl RunAuditEntry {
    pub fn new(
        run_id: impl Into<String>,
        kind: RunKind,
        phase: Option<Phase>,
        success: bool,
        document: serde_json::Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            phase,
            success,
            recorded_at: Utc::now(),
            document,
        }
    }
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait QualificationStore: Send + Sync {
    /// Replace a phase's records with a new generation in one transaction.
    /// Returns the number of records written.
    async fn replace_all(&self, phase: Phase, run_id: &str, records: &[StageRecord]) -> anyhow::Result<usize>;

    /// Latest record per symbol in the phase's current generation.
    async fn find_latest_per_identifier(
        &self,
        phase: Phase,
        filter: &RecordFilter,
        sort: RecordSort,
    ) -> anyhow::Result<Vec<StageRecord>>;

    /// Number of current records matching the filter (limit ignored).
    async fn count(&self, phase: Phase, filter: &RecordFilter) -> anyhow::Result<usize>;

    async fn record_run(&self, entry: &RunAuditEntry) -> anyhow::Result<()>;

    /// Most recent audit rows, newest first.
    async fn recent_runs(&self, limit: usize) -> anyhow::Result<Vec<RunAuditEntry>>;
}
