//! Execution state tracker.
//!
//! Turns the funnel's final picks into recommendation cards, follows
//! approved cards through pre-open gap checks and price polling, and
//! rolls everything up into a system health view.
//!
//! Lifecycles:
//! - Recommendation: draft → approved | expired
//! - Position: pending → active → target_1_hit → target_2_hit,
//!   with stopped_out and closed as exits

mod gap;
mod health;
mod position;
mod recommendation;

pub use gap::{classify_gap, gap_pct, GapAction, GapDecision, GapRules};
pub use health::{LastRun, SystemHealth};
pub use position::{Position, PositionStatus, PriceSnapshot};
pub use recommendation::{CardFields, Recommendation, RecommendationStatus, RecommendationStep};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data::MarketDataProvider;
use crate::funnel::StageRecord;
use crate::store::{QualificationStore, SqliteStore};
use sieve_common::config::ExecutionConfig;

/// Audit rows scanned for the last funnel run.
const HEALTH_AUDIT_WINDOW: usize = 200;

/// Entry zone, stop and targets of a card.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop: f64,
    pub target_1: f64,
    pub target_2: f64,
}

/// Errors from execution state transitions.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("recommendation {0} has expired")]
    Expired(String),

    #[error("cannot move {id} from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<ExecutionError> for sieve_common::Error {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::NotFound(what) => Self::NotFound(what),
            e @ (ExecutionError::Expired(_) | ExecutionError::InvalidTransition { .. }) => {
                Self::Conflict(e.to_string())
            }
            ExecutionError::Storage(e) => Self::Storage(format!("{e:#}")),
        }
    }
}

/// Opening quote used for the gap check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub prev_close: f64,
}

/// Gap decision for one approved card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    pub recommendation_id: String,
    pub symbol: String,
    pub decision: GapDecision,
}

// ============================================================================
// Execution Tracker
// ============================================================================

pub struct ExecutionTracker {
    store: Arc<SqliteStore>,
    config: ExecutionConfig,
}

impl ExecutionTracker {
    pub fn new(store: Arc<SqliteStore>, config: ExecutionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn gap_rules(&self) -> GapRules {
        GapRules {
            chase_limit_pct: self.config.chase_limit_pct,
            gap_wait_pct: self.config.gap_wait_pct,
        }
    }

    // ========================================================================
    // Recommendations
    // ========================================================================

    /// Draft a card per record. Records without usable levels are skipped.
    pub async fn create_drafts(&self, run_id: &str, records: &[StageRecord]) -> Result<Vec<Recommendation>> {
        let now = Utc::now();
        let ttl = Duration::days(self.config.recommendation_ttl_days);

        let mut drafts = Vec::with_capacity(records.len());
        for record in records {
            let fields: CardFields = match record.metrics_as() {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(symbol = %record.symbol, error = %e, "Record has no card fields, skipping");
                    continue;
                }
            };
            if fields.shares == 0 {
                debug!(symbol = %record.symbol, "Zero shares, skipping");
                continue;
            }
            drafts.push(Recommendation::draft(run_id, record, fields, now, ttl));
        }

        self.store.replace_drafts(&drafts).await?;
        Ok(drafts)
    }

    /// Approve a draft and open a pending position for it.
    pub async fn approve(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Recommendation, Position), ExecutionError> {
        let mut rec = self
            .store
            .get_recommendation(id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(format!("recommendation {id}")))?;

        if let Err(e) = rec.approve(now) {
            if rec.status == RecommendationStatus::Expired {
                self.store.save_recommendation(&rec).await?;
            }
            return Err(e);
        }

        let position = Position::new(&rec.id, &rec.symbol, rec.shares, rec.levels, now);
        rec.position_id = Some(position.id.clone());
        self.store.save_position(&position).await?;
        self.store.save_recommendation(&rec).await?;

        info!(recommendation_id = %rec.id, symbol = %rec.symbol, position_id = %position.id, "Approved recommendation");
        Ok((rec, position))
    }

    /// Expire due cards. Positions that never filled are closed with them.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for mut rec in self.store.list_recommendations(None).await? {
            if !rec.expire_if_due(now) {
                continue;
            }
            self.store.save_recommendation(&rec).await?;
            expired += 1;

            let Some(position_id) = rec.position_id.as_deref() else {
                continue;
            };
            if let Some(mut position) = self.store.get_position(position_id).await? {
                if position.status == PositionStatus::Pending {
                    position.close(None, "not_filled", now);
                    self.store.save_position(&position).await?;
                }
            }
        }

        if expired > 0 {
            info!(expired, "Expired recommendations");
        }
        Ok(expired)
    }

    pub async fn recommendations(&self, status: Option<RecommendationStatus>) -> Result<Vec<Recommendation>> {
        self.store.list_recommendations(status).await
    }

    // ========================================================================
    // Gap Check
    // ========================================================================

    /// Classify every approved card that has a quote.
    pub async fn check_gaps(&self, quotes: &HashMap<String, Quote>) -> Result<Vec<GapReport>> {
        let rules = self.gap_rules();
        let mut reports = Vec::new();

        for mut rec in self
            .store
            .list_recommendations(Some(RecommendationStatus::Approved))
            .await?
        {
            let Some(quote) = quotes.get(&rec.symbol) else {
                continue;
            };
            let decision = classify_gap(quote.price, quote.prev_close, &rec.levels, &rules);
            debug!(symbol = %rec.symbol, action = ?decision.action, gap_pct = decision.gap_pct, "Gap check");

            rec.last_gap = Some(decision.clone());
            self.store.save_recommendation(&rec).await?;
            reports.push(GapReport {
                recommendation_id: rec.id.clone(),
                symbol: rec.symbol.clone(),
                decision,
            });
        }
        Ok(reports)
    }

    /// Opening quotes from the latest two daily bars (today's open against
    /// the prior close). Symbols without two bars are left out.
    pub async fn fetch_quotes(
        &self,
        provider: &dyn MarketDataProvider,
        symbols: &[String],
    ) -> HashMap<String, Quote> {
        let mut quotes = HashMap::new();
        for symbol in symbols {
            match provider.get_daily_candles(symbol, 2).await {
                Ok(candles) if candles.len() >= 2 => {
                    let (prev, last) = (&candles[candles.len() - 2], &candles[candles.len() - 1]);
                    quotes.insert(
                        symbol.clone(),
                        Quote {
                            price: last.open,
                            prev_close: prev.close,
                        },
                    );
                }
                Ok(_) => debug!(symbol = %symbol, "Not enough bars for a quote"),
                Err(e) => warn!(symbol = %symbol, error = %e, "Quote fetch failed"),
            }
        }
        quotes
    }

    pub async fn run_gap_check(&self, provider: &dyn MarketDataProvider) -> Result<Vec<GapReport>> {
        let symbols: Vec<String> = self
            .store
            .list_recommendations(Some(RecommendationStatus::Approved))
            .await?
            .into_iter()
            .map(|r| r.symbol)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let quotes = self.fetch_quotes(provider, &symbols).await;
        self.check_gaps(&quotes).await
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// Fold snapshots into open positions and close those held too long.
    pub async fn apply_snapshots(
        &self,
        snapshots: &HashMap<String, PriceSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let mut updated = Vec::new();
        for mut position in self.store.list_positions(true).await? {
            let before = position.status;
            if let Some(snapshot) = snapshots.get(&position.symbol) {
                position.apply_snapshot(snapshot);
            }

            if position.activated_at.is_some()
                && position.days_held(now) >= self.config.max_holding_days
            {
                position.close(position.last_price, "max_holding_days", now);
            }

            if position.status != before {
                info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    from = before.as_str(),
                    to = position.status.as_str(),
                    "Position status changed"
                );
            }
            self.store.save_position(&position).await?;
            updated.push(position);
        }
        Ok(updated)
    }

    /// Snapshot every open symbol from its latest daily bar and apply it.
    pub async fn poll_positions(
        &self,
        provider: &dyn MarketDataProvider,
        now: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let symbols: BTreeSet<String> = self
            .store
            .list_positions(true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();

        let mut snapshots = HashMap::new();
        for symbol in symbols {
            match provider.get_daily_candles(&symbol, 1).await {
                Ok(candles) => {
                    if let Some(bar) = candles.last() {
                        snapshots.insert(
                            symbol,
                            PriceSnapshot {
                                last: bar.close,
                                high: bar.high,
                                low: bar.low,
                                at: now,
                            },
                        );
                    }
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Price poll failed"),
            }
        }
        self.apply_snapshots(&snapshots, now).await
    }

    pub async fn close_position(
        &self,
        id: &str,
        exit_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        let mut position = self
            .store
            .get_position(id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(format!("position {id}")))?;
        if position.status == PositionStatus::Closed {
            return Err(ExecutionError::InvalidTransition {
                id: id.to_string(),
                from: position.status.as_str().to_string(),
                to: PositionStatus::Closed.as_str().to_string(),
            });
        }
        let exit = exit_price.or(position.last_price);
        position.close(exit, "manual", now);
        self.store.save_position(&position).await?;
        info!(position_id = %id, exit_price = ?exit, "Closed position");
        Ok(position)
    }

    pub async fn positions(&self, open_only: bool) -> Result<Vec<Position>> {
        self.store.list_positions(open_only).await
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn system_health(&self, now: DateTime<Utc>) -> Result<SystemHealth> {
        let positions = self.store.list_positions(false).await?;
        let recommendations = self.store.list_recommendations(None).await?;
        let audit = self.store.recent_runs(HEALTH_AUDIT_WINDOW).await?;
        let phases = self.store.phase_summaries().await?;
        Ok(SystemHealth::compute(
            &positions,
            &recommendations,
            LastRun::from_audit(&audit),
            phases,
            now,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
