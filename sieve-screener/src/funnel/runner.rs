//! Stage runner: the single fetch → score → gate → persist pipeline.
//!
//! A run never returns an error. Every failure is folded into the
//! returned [`StageRunResult`] together with the state transitions the
//! run went through.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::gate::{evaluate, validate_required_minimum};
use super::retry::{RetryPolicy, StepError};
use super::scoring::{score_population, validate_weights};
use super::stage::{CandidateSource, Phase, Scored, StageParams, StageRecord, StageSpec};
use crate::circuit_breaker::CircuitBreaker;
use crate::data::{BatchedFetcher, FetchError, ProviderError};
use crate::store::{QualificationStore, RecordFilter, RecordSort, RunAuditEntry, RunKind};

/// Default number of top records echoed back in a result.
pub const DEFAULT_TOP_N: usize = 10;

// ============================================================================
// Result Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Fetching,
    Scoring,
    Gating,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub state: StageState,
    pub at: DateTime<Utc>,
}

/// Compact view of a qualified record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub symbol: String,
    pub composite: f64,
    pub percentile_rank: f64,
    pub filters_passed: usize,
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunResult {
    pub run_id: String,
    pub phase: Phase,
    pub success: bool,
    pub total_input: usize,
    pub total_fetched: usize,
    pub total_analyzed: usize,
    pub total_qualified: usize,
    /// Qualified symbols, best first
    pub qualified: Vec<String>,
    pub top: Vec<RecordSummary>,
    pub error: Option<String>,
    /// Set on soft failures and other notable successes
    pub message: Option<String>,
    pub transitions: Vec<StageTransition>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl StageRunResult {
    pub fn begin(phase: Phase, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            success: false,
            total_input: 0,
            total_fetched: 0,
            total_analyzed: 0,
            total_qualified: 0,
            qualified: Vec::new(),
            top: Vec::new(),
            error: None,
            message: None,
            transitions: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
        }
    }

    /// A result for a step that never got to run its pipeline.
    pub fn failed(phase: Phase, run_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::begin(phase, run_id);
        result.fail(error);
        result
    }

    pub fn enter(&mut self, state: StageState) {
        debug!(phase = %self.phase, run_id = %self.run_id, state = ?state, "Stage transition");
        self.transitions.push(StageTransition { state, at: Utc::now() });
    }

    pub fn state(&self) -> Option<StageState> {
        self.transitions.last().map(|t| t.state)
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.enter(StageState::Failed);
        self.completed_at = Some(Utc::now());
    }

    pub fn complete(&mut self, message: Option<String>) {
        self.success = true;
        self.message = message;
        self.enter(StageState::Done);
        self.completed_at = Some(Utc::now());
    }
}

// ============================================================================
// Stage Runner
// ============================================================================

pub struct StageRunner<S: StageSpec> {
    spec: Arc<S>,
    store: Arc<dyn QualificationStore>,
    fetcher: BatchedFetcher,
    retry: RetryPolicy,
    top_n: usize,
    audit: bool,
}

impl<S: StageSpec> StageRunner<S> {
    pub fn new(
        spec: Arc<S>,
        store: Arc<dyn QualificationStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        let fetcher = BatchedFetcher::new(spec.phase().as_str(), spec.fetch_delay(), breaker);
        Self {
            spec,
            store,
            fetcher,
            retry,
            top_n: DEFAULT_TOP_N,
            audit: true,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Whether results are written to the run audit.
    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    pub fn phase(&self) -> Phase {
        self.spec.phase()
    }

    /// Run the stage once. Never fails; see `StageRunResult::success`.
    pub async fn run(&self, params: StageParams) -> StageRunResult {
        let phase = self.spec.phase();
        let started = Instant::now();
        let mut result = StageRunResult::begin(phase, params.run_id.clone());

        info!(phase = %phase, run_id = %params.run_id, "Stage started");
        self.execute(&params, &mut result).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        if result.success {
            info!(
                phase = %phase,
                run_id = %result.run_id,
                input = result.total_input,
                fetched = result.total_fetched,
                analyzed = result.total_analyzed,
                qualified = result.total_qualified,
                duration_ms = result.duration_ms,
                message = result.message.as_deref().unwrap_or(""),
                "Stage complete"
            );
        } else {
            error!(
                phase = %phase,
                run_id = %result.run_id,
                error = result.error.as_deref().unwrap_or(""),
                "Stage failed"
            );
        }

        if self.audit {
            self.record_audit(&result).await;
        }
        result
    }

    async fn execute(&self, params: &StageParams, result: &mut StageRunResult) {
        let spec = self.spec.as_ref();
        let phase = spec.phase();
        let cancel = &params.cancel;

        // ---- Fetching ----
        result.enter(StageState::Fetching);

        let candidates = match self.resolve_candidates(params).await {
            Ok(c) => c,
            Err(e) => return result.fail(e),
        };
        result.total_input = candidates.len();

        if candidates.is_empty() {
            warn!(phase = %phase, run_id = %params.run_id, "No input candidates");
            return self.complete_empty(params, result, "no input candidates").await;
        }

        let ctx = match self
            .retry
            .run("prepare", cancel, |_: &anyhow::Error| true, || spec.prepare(&candidates))
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return result.fail(e.to_string()),
        };
        let ctx = &ctx;

        let batch = self
            .retry
            .run(
                "fetch",
                cancel,
                |e: &FetchError| matches!(e, FetchError::CircuitOpen { .. }),
                || {
                    self.fetcher.fetch_batch(
                        &candidates,
                        move |symbol: String| async move { spec.fetch_one(&symbol, ctx).await },
                        cancel,
                    )
                },
            )
            .await;
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => return result.fail(e.to_string()),
        };
        result.total_fetched = batch.len();

        if batch.all_failed() {
            let message = format!("all {} fetches failed", batch.requested());
            warn!(phase = %phase, run_id = %params.run_id, "{message}");
            return self.complete_empty(params, result, message).await;
        }

        // ---- Scoring ----
        if cancel.is_cancelled() {
            return result.fail("cancelled before scoring");
        }
        result.enter(StageState::Scoring);

        let components = spec.components();
        if let Err(e) = validate_weights(&components) {
            return result.fail(format!("invalid {phase} weights: {e}"));
        }
        let predicates = spec.predicates();
        let required_minimum = spec.required_minimum();
        if let Err(e) = validate_required_minimum(required_minimum, predicates.len()) {
            return result.fail(format!("invalid {phase} gate: {e}"));
        }

        let (symbols, metrics): (Vec<String>, Vec<S::Metrics>) = batch
            .into_entries()
            .into_iter()
            .filter_map(|(symbol, payload)| {
                let measured = spec.measure(&symbol, &payload, ctx);
                if measured.is_none() {
                    debug!(phase = %phase, symbol = %symbol, "Insufficient data for metrics");
                }
                measured.map(|m| (symbol, m))
            })
            .unzip();

        let cards = score_population(&metrics, &components);
        let mut scored: Vec<Scored<S::Metrics>> = symbols
            .into_iter()
            .zip(metrics)
            .zip(cards)
            .map(|((symbol, metrics), card)| Scored { symbol, metrics, card })
            .collect();
        spec.after_scoring(&mut scored, ctx);
        result.total_analyzed = scored.len();

        // ---- Gating ----
        if cancel.is_cancelled() {
            return result.fail("cancelled before gating");
        }
        result.enter(StageState::Gating);

        let thresholds = spec.thresholds(ctx);
        let record_context = spec.record_context(ctx);
        let run_at = Utc::now();

        let mut records = Vec::with_capacity(scored.len());
        for s in &scored {
            let outcome = evaluate(&predicates, &s.metrics, &s.card, &thresholds, required_minimum);
            let metrics = match serde_json::to_value(&s.metrics) {
                Ok(v) => v,
                Err(e) => return result.fail(format!("failed to encode metrics for {}: {e}", s.symbol)),
            };
            records.push(StageRecord {
                symbol: s.symbol.clone(),
                phase,
                run_id: params.run_id.clone(),
                run_at,
                metrics,
                components: s.card.components.clone(),
                composite: s.card.composite,
                percentile_rank: s.card.percentile_rank,
                gates: outcome.results,
                filters_passed: outcome.filters_passed,
                required_minimum,
                qualifies: outcome.qualifies,
                context: record_context.clone(),
            });
        }
        records.sort_by(|a, b| {
            b.percentile_rank
                .partial_cmp(&a.percentile_rank)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // ---- Persisting ----
        if cancel.is_cancelled() {
            return result.fail("cancelled before persisting");
        }
        result.enter(StageState::Persisting);

        if let Err(e) = self.persist(params, &records).await {
            return result.fail(e.to_string());
        }

        let qualified: Vec<&StageRecord> = records.iter().filter(|r| r.qualifies).collect();
        result.total_qualified = qualified.len();
        result.qualified = qualified.iter().map(|r| r.symbol.clone()).collect();
        result.top = qualified
            .iter()
            .take(self.top_n)
            .map(|r| RecordSummary {
                symbol: r.symbol.clone(),
                composite: r.composite,
                percentile_rank: r.percentile_rank,
                filters_passed: r.filters_passed,
            })
            .collect();

        let message = records.is_empty().then(|| "no valid metrics".to_string());
        result.complete(message);
    }

    /// Replace the phase's current generation with `records`.
    async fn persist(&self, params: &StageParams, records: &[StageRecord]) -> Result<(), StepError> {
        let phase = self.spec.phase();
        self.retry
            .run("persist", &params.cancel, |_: &anyhow::Error| true, || {
                self.store.replace_all(phase, &params.run_id, records)
            })
            .await
            .map(|_| ())
    }

    /// Soft failure: the run succeeds, but leaves an empty generation so
    /// the previous run's records stop being current.
    async fn complete_empty(
        &self,
        params: &StageParams,
        result: &mut StageRunResult,
        message: impl Into<String>,
    ) {
        result.enter(StageState::Persisting);
        if let Err(e) = self.persist(params, &[]).await {
            return result.fail(e.to_string());
        }
        result.complete(Some(message.into()));
    }

    async fn resolve_candidates(&self, params: &StageParams) -> Result<Vec<String>, String> {
        if let Some(ref candidates) = params.candidates {
            return Ok(candidates.clone());
        }

        match self.spec.candidate_source() {
            CandidateSource::Upstream(upstream) => {
                let filter = RecordFilter::qualified();
                let records = self
                    .retry
                    .run("load_candidates", &params.cancel, |_: &anyhow::Error| true, || {
                        self.store.find_latest_per_identifier(
                            upstream,
                            &filter,
                            RecordSort::CompositeDesc,
                        )
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(records.into_iter().map(|r| r.symbol).collect())
            }
            CandidateSource::Discover => self
                .retry
                .run("discover", &params.cancel, ProviderError::is_recoverable, || {
                    self.spec.discover()
                })
                .await
                .map_err(|e| e.to_string()),
        }
    }

    async fn record_audit(&self, result: &StageRunResult) {
        let document = match serde_json::to_value(result) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "Failed to encode stage result for audit");
                return;
            }
        };
        let entry = RunAuditEntry::new(
            result.run_id.clone(),
            RunKind::Stage,
            Some(result.phase),
            result.success,
            document,
        );
        if let Err(e) = self.store.record_run(&entry).await {
            warn!(phase = %result.phase, run_id = %result.run_id, error = %e, "Failed to record stage audit");
        }
    }
}
