//! Recommendation cards and the funnel step that drafts them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::gap::GapDecision;
use super::{ExecutionError, ExecutionTracker, TradeLevels};
use crate::funnel::{
    FunnelStep, Phase, RetryPolicy, StageParams, StageRecord, StageRunResult, StageState, StepError,
};
use crate::store::{QualificationStore, RecordFilter, RecordSort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Draft,
    Approved,
    Expired,
}

impl RecommendationStatus {
    pub const ALL: [RecommendationStatus; 3] = [
        RecommendationStatus::Draft,
        RecommendationStatus::Approved,
        RecommendationStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Draft => "draft",
            RecommendationStatus::Approved => "approved",
            RecommendationStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for RecommendationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecommendationStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown recommendation status: {s}"))
    }
}

/// A trade idea for manual execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    /// Funnel run that produced the card
    pub run_id: String,
    pub symbol: String,
    pub status: RecommendationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub levels: TradeLevels,
    pub shares: u64,
    pub position_value: f64,
    pub composite: f64,
    pub percentile_rank: f64,
    /// Gates passed on the way through the funnel
    #[serde(default)]
    pub rationale: Vec<String>,
    pub position_id: Option<String>,
    pub last_gap: Option<GapDecision>,
}

/// Fields a portfolio record must carry to become a card.
#[derive(Debug, Clone, Deserialize)]
pub struct CardFields {
    pub levels: TradeLevels,
    pub shares: u64,
    pub position_value: f64,
}

impl Recommendation {
    pub fn draft(
        run_id: &str,
        record: &StageRecord,
        fields: CardFields,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            symbol: record.symbol.clone(),
            status: RecommendationStatus::Draft,
            created_at: now,
            expires_at: now + ttl,
            approved_at: None,
            levels: fields.levels,
            shares: fields.shares,
            position_value: fields.position_value,
            composite: record.composite,
            percentile_rank: record.percentile_rank,
            rationale: record
                .gates
                .iter()
                .filter(|g| g.passed)
                .map(|g| g.name.clone())
                .collect(),
            position_id: None,
            last_gap: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Draft → approved.
    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        if self.status == RecommendationStatus::Draft && self.is_expired_at(now) {
            self.status = RecommendationStatus::Expired;
            return Err(ExecutionError::Expired(self.id.clone()));
        }
        if self.status != RecommendationStatus::Draft {
            return Err(ExecutionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.as_str().to_string(),
                to: RecommendationStatus::Approved.as_str().to_string(),
            });
        }
        self.status = RecommendationStatus::Approved;
        self.approved_at = Some(now);
        Ok(())
    }

    /// Expire when due. Returns whether the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RecommendationStatus::Expired || !self.is_expired_at(now) {
            return false;
        }
        self.status = RecommendationStatus::Expired;
        true
    }
}

// ============================================================================
// Recommendation Step
// ============================================================================

/// Final funnel step: drafts cards from the portfolio's qualified records.
pub struct RecommendationStep {
    store: Arc<dyn QualificationStore>,
    tracker: Arc<ExecutionTracker>,
    retry: RetryPolicy,
}

impl RecommendationStep {
    pub fn new(store: Arc<dyn QualificationStore>, tracker: Arc<ExecutionTracker>) -> Self {
        Self {
            store,
            tracker,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff applied to the portfolio read and the draft write.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn load_records(&self, params: &StageParams) -> Result<Vec<StageRecord>, StepError> {
        let filter = RecordFilter {
            qualified_only: true,
            symbols: params.candidates.clone(),
            ..Default::default()
        };
        self.retry
            .run("load_portfolio", &params.cancel, |_: &anyhow::Error| true, || {
                self.store
                    .find_latest_per_identifier(Phase::Portfolio, &filter, RecordSort::CompositeDesc)
            })
            .await
    }
}

#[async_trait]
impl FunnelStep for RecommendationStep {
    fn phase(&self) -> Phase {
        Phase::Recommendation
    }

    async fn run(&self, params: StageParams) -> StageRunResult {
        let mut result = StageRunResult::begin(Phase::Recommendation, params.run_id.clone());
        result.enter(StageState::Fetching);

        let records = match self.load_records(&params).await {
            Ok(records) => records,
            Err(e) => {
                result.fail(format!("failed to load portfolio records: {e}"));
                return result;
            }
        };
        result.total_input = params.candidates.as_ref().map_or(records.len(), Vec::len);
        result.total_fetched = records.len();

        if records.is_empty() {
            result.complete(Some("no portfolio picks to recommend".to_string()));
            return result;
        }

        if params.cancel.is_cancelled() {
            result.fail("cancelled before persisting");
            return result;
        }
        result.enter(StageState::Persisting);

        // Drafts are swapped in one transaction, so a retry never duplicates
        let drafted = self
            .retry
            .run("draft", &params.cancel, |_: &anyhow::Error| true, || {
                self.tracker.create_drafts(&params.run_id, &records)
            })
            .await;
        match drafted {
            Ok(drafts) => {
                info!(run_id = %params.run_id, drafts = drafts.len(), "Drafted recommendations");
                result.total_analyzed = records.len();
                result.total_qualified = drafts.len();
                result.qualified = drafts.iter().map(|d| d.symbol.clone()).collect();
                result.complete(None);
            }
            Err(e) => {
                warn!(run_id = %params.run_id, error = %e, "Drafting recommendations failed");
                result.fail(format!("failed to draft recommendations: {e}"));
            }
        }
        result
    }
}
