//! End-to-end tests for the stage runner and the assembled funnel.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use sieve_common::Config;
use sieve_screener::circuit_breaker::CircuitBreaker;
use sieve_screener::data::ProviderError;
use sieve_screener::funnel::gate::{at_least, at_most};
use sieve_screener::funnel::{
    Normalization, Phase, Predicate, RetryPolicy, ScoreCard, ScoreComponent, StageParams, StageRunner, StageSpec,
    StageState,
};
use sieve_screener::execution::RecommendationStatus;
use sieve_screener::routes::{self, FunnelRunQuery, RecordsQuery};
use sieve_screener::store::{QualificationStore, RecordFilter, RecordSort, RunKind, SqliteStore};
use sieve_screener::ScreenerState;

use common::{growing_quarters, trending, MockProvider};

// ============================================================================
// A minimal stage
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct Reading {
    value: f64,
}

#[derive(Debug, Serialize)]
struct Band {
    lo: f64,
    hi: f64,
}

/// Reads one number per symbol and gates it into a band.
struct BandStage {
    readings: HashMap<String, f64>,
    fetches: AtomicU32,
}

impl BandStage {
    fn new(readings: &[(&str, f64)]) -> Self {
        Self {
            readings: readings.iter().map(|(s, v)| (s.to_string(), *v)).collect(),
            fetches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StageSpec for BandStage {
    type Payload = f64;
    type Metrics = Reading;
    type Thresholds = Band;
    type Context = ();

    fn phase(&self) -> Phase {
        Phase::Momentum
    }

    fn fetch_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn required_minimum(&self) -> usize {
        2
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_one(&self, symbol: &str, _ctx: &()) -> Result<f64, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.readings
            .get(symbol)
            .copied()
            .ok_or_else(|| ProviderError::DataNotAvailable(symbol.to_string()))
    }

    fn measure(&self, _symbol: &str, value: &f64, _ctx: &()) -> Option<Reading> {
        Some(Reading { value: *value })
    }

    fn components(&self) -> Vec<ScoreComponent<Reading>> {
        vec![ScoreComponent::new("value", 1.0, Normalization::MinMax, |m: &Reading| m.value)]
    }

    fn thresholds(&self, _ctx: &()) -> Band {
        Band { lo: 10.0, hi: 100.0 }
    }

    fn predicates(&self) -> Vec<Predicate<Reading, Band>> {
        vec![
            Predicate::new("above_floor", |m: &Reading, _: &ScoreCard, t: &Band| at_least(m.value, t.lo)),
            Predicate::new("below_cap", |m: &Reading, _: &ScoreCard, t: &Band| at_most(m.value, t.hi)),
        ]
    }
}

fn runner(spec: Arc<BandStage>, store: Arc<SqliteStore>) -> StageRunner<BandStage> {
    StageRunner::new(
        spec,
        store,
        Arc::new(CircuitBreaker::with_name("test")),
        RetryPolicy::immediate(2),
    )
}

fn candidates(symbols: &[&str]) -> Vec<String> {
    symbols.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_three_candidates_one_missing_one_gated_one_passing() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let spec = Arc::new(BandStage::new(&[("LOW", 5.0), ("GOOD", 50.0)]));
    let runner = runner(spec.clone(), store.clone());

    let result = runner
        .run(StageParams::with_candidates("run-1", candidates(&["MISSING", "LOW", "GOOD"])))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.total_input, 3);
    assert_eq!(result.total_fetched, 2);
    assert_eq!(result.total_analyzed, 2);
    assert_eq!(result.total_qualified, 1);
    assert_eq!(result.qualified, vec!["GOOD".to_string()]);
    assert_eq!(spec.fetches.load(Ordering::SeqCst), 3);

    let records = store
        .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let low = records.iter().find(|r| r.symbol == "LOW").unwrap();
    assert!(!low.qualifies);
    assert_eq!(low.filters_passed, 1);
    assert_eq!(low.gates[0].name, "above_floor");
    assert!(!low.gates[0].passed);
}

#[tokio::test]
async fn test_rerun_replaces_previous_generation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let spec = Arc::new(BandStage::new(&[("A", 20.0), ("B", 30.0), ("C", 40.0)]));
    let runner = runner(spec, store.clone());

    runner
        .run(StageParams::with_candidates("run-1", candidates(&["A", "B", "C"])))
        .await;
    let second = runner
        .run(StageParams::with_candidates("run-2", candidates(&["C"])))
        .await;
    assert!(second.success);

    let records = store
        .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].symbol, "C");
    assert_eq!(records[0].run_id, "run-2");
}

#[tokio::test]
async fn test_soft_failures_are_successes_with_a_message() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let spec = Arc::new(BandStage::new(&[]));
    let runner = runner(spec.clone(), store);

    let empty = runner.run(StageParams::with_candidates("run-1", Vec::new())).await;
    assert!(empty.success);
    assert_eq!(empty.message.as_deref(), Some("no input candidates"));
    assert_eq!(spec.fetches.load(Ordering::SeqCst), 0);

    let all_failed = runner
        .run(StageParams::with_candidates("run-2", candidates(&["X", "Y"])))
        .await;
    assert!(all_failed.success);
    assert_eq!(all_failed.total_analyzed, 0);
    assert!(all_failed.message.unwrap().contains("all 2 fetches failed"));
}

#[tokio::test]
async fn test_soft_failure_rerun_clears_previous_generation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let spec = Arc::new(BandStage::new(&[("GOOD", 50.0)]));
    let runner = runner(spec, store.clone());

    let current = |store: Arc<SqliteStore>| async move {
        store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::qualified(), RecordSort::Symbol)
            .await
            .unwrap()
    };

    let first = runner
        .run(StageParams::with_candidates("run-1", candidates(&["GOOD"])))
        .await;
    assert_eq!(first.total_qualified, 1);
    assert_eq!(current(store.clone()).await.len(), 1);

    // No candidates: succeeds, and GOOD from run-1 is no longer served
    let empty = runner.run(StageParams::with_candidates("run-2", Vec::new())).await;
    assert!(empty.success);
    assert!(empty.transitions.iter().any(|t| t.state == StageState::Persisting));
    assert!(current(store.clone()).await.is_empty());

    runner
        .run(StageParams::with_candidates("run-3", candidates(&["GOOD"])))
        .await;
    assert_eq!(current(store.clone()).await.len(), 1);

    // Every fetch fails: same outcome
    let failed = runner
        .run(StageParams::with_candidates("run-4", candidates(&["NOPE"])))
        .await;
    assert!(failed.success);
    assert_eq!(failed.state(), Some(StageState::Done));
    assert!(current(store.clone()).await.is_empty());
    assert_eq!(store.count(Phase::Momentum, &RecordFilter::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_standalone_run_reads_qualified_upstream() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let spec = Arc::new(BandStage::new(&[("GOOD", 50.0)]));
    let runner = runner(spec, store.clone());

    // Nothing qualified upstream yet
    let result = runner.run(StageParams::standalone("run-1")).await;
    assert!(result.success);
    assert_eq!(result.total_input, 0);

    let audit = store.recent_runs(10).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, RunKind::Stage);
    assert_eq!(audit[0].phase, Some(Phase::Momentum));
}

// ============================================================================
// Assembled funnel
// ============================================================================

fn quick_config() -> Config {
    let mut config = Config::default();
    config.funnel.retry.initial_backoff_ms = 10;
    config.funnel.retry.max_backoff_ms = 20;
    config.screener = serde_json::json!({
        "universe": { "fetch_delay_ms": 0 },
        "momentum": { "fetch_delay_ms": 0 },
        "consistency": { "fetch_delay_ms": 0 },
        "liquidity": { "fetch_delay_ms": 0 },
        "setup": { "fetch_delay_ms": 0 },
        "fundamentals": { "fetch_delay_ms": 0 },
        "risk": { "fetch_delay_ms": 0 }
    });
    config
}

fn market() -> MockProvider {
    MockProvider::new()
        .with_instrument("AAA", "EQ", Some("IT"))
        .with_instrument("BBB", "EQ", Some("Banks"))
        .with_instrument("CCC", "EQ", Some("Auto"))
        .with_instrument("GHOST", "EQ", None)
        .with_instrument("BONDX", "BE", None)
        .with_candles("AAA", trending(260, 500.0, 0.10, 200_000.0))
        .with_candles("BBB", trending(260, 800.0, 0.05, 150_000.0))
        .with_candles("CCC", trending(260, 300.0, 0.15, 400_000.0))
        .with_quarters("AAA", growing_quarters(8, 2_000.0, 4.0, 22.0))
        .with_quarters("BBB", growing_quarters(8, 5_000.0, 2.0, 30.0))
        .with_quarters("CCC", growing_quarters(8, 1_200.0, 6.0, 14.0))
        .with_holding("AAA", 55.0, 20.0)
        .with_holding("BBB", 40.0, 35.0)
        .with_holding("CCC", 62.0, 12.0)
}

/// Every phase keeps whatever it can measure, so the whole chain is exercised.
fn permissive_config() -> Config {
    let mut config = quick_config();
    for phase in [
        "universe",
        "momentum",
        "consistency",
        "liquidity",
        "setup",
        "fundamentals",
        "risk",
        "portfolio",
    ] {
        let section = config.screener[phase].take();
        let mut section = if section.is_object() { section } else { serde_json::json!({}) };
        section["required_minimum"] = serde_json::json!(0);
        config.screener[phase] = section;
    }
    config
}

fn state_with(config: Config) -> Arc<ScreenerState> {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    Arc::new(ScreenerState::with_parts(config, Arc::new(market()), store).unwrap())
}

fn state() -> Arc<ScreenerState> {
    state_with(quick_config())
}

#[tokio::test]
async fn test_full_funnel_runs_every_phase() {
    let state = state_with(permissive_config());
    let result = state.run_funnel(None).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stages.len(), 9);
    assert_eq!(result.stages[8].phase, Phase::Recommendation);

    let universe = result.stage(Phase::Universe).unwrap();
    assert_eq!(universe.total_input, 4);
    assert_eq!(universe.total_fetched, 3);
    assert_eq!(universe.total_qualified, 3);
    assert!(!universe.qualified.contains(&"BONDX".to_string()));

    let records = state
        .store
        .find_latest_per_identifier(Phase::Universe, &RecordFilter::qualified(), RecordSort::Symbol)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].symbol, "AAA");
    assert_eq!(records[0].metrics["sector"], "IT");

    // Momentum records carry the regime they were gated under
    let momentum = state
        .store
        .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
        .await
        .unwrap();
    assert_eq!(momentum.len(), 3);
    assert_eq!(momentum[0].context["regime"], "sideways");

    // All three survivors make it through to a draft card
    for phase in [
        Phase::Consistency,
        Phase::Liquidity,
        Phase::Setup,
        Phase::Fundamentals,
        Phase::Risk,
        Phase::Portfolio,
    ] {
        let stage = result.stage(phase).unwrap();
        assert!(stage.success, "{phase}: {:?}", stage.error);
        assert_eq!(stage.total_input, 3, "{phase}");
        assert_eq!(stage.total_qualified, 3, "{phase}");
    }
    let recommendation = result.stage(Phase::Recommendation).unwrap();
    assert_eq!(recommendation.total_qualified, 3);
    assert_eq!(result.final_qualified.len(), 3);

    let drafts = state
        .tracker
        .recommendations(Some(RecommendationStatus::Draft))
        .await
        .unwrap();
    assert_eq!(drafts.len(), 3);
    assert!(drafts.iter().all(|d| d.shares > 0 && d.levels.stop < d.levels.entry_low));

    let audit = state.store.recent_runs(50).await.unwrap();
    assert_eq!(audit[0].kind, RunKind::Funnel);
    assert_eq!(audit[0].run_id, result.run_id);
    assert_eq!(audit.iter().filter(|e| e.kind == RunKind::Stage).count(), 8);
}

#[tokio::test]
async fn test_second_trigger_rejected_while_running() {
    let state = state();
    let permit = state.runs.try_acquire().unwrap();

    let err = routes::run_funnel(State(state.clone()), Query(FunnelRunQuery::default()))
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

    let err = state.run_stage(Phase::Universe).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    drop(permit);
    assert!(state.run_stage(Phase::Universe).await.unwrap().success);
}

#[tokio::test]
async fn test_stage_endpoints() {
    let state = state();
    let run = routes::run_stage(State(state.clone()), Path("universe".to_string()))
        .await
        .unwrap();
    assert!(run.0.success);
    assert_eq!(run.0.total_qualified, 3);

    let query = RecordsQuery {
        qualified: true,
        limit: Some(2),
        sort: RecordSort::Symbol,
    };
    let records = routes::get_stage_records(State(state.clone()), Path("universe".to_string()), Query(query))
        .await
        .unwrap();
    assert_eq!(records.0.count, 2);
    assert_eq!(records.0.records[1].symbol, "BBB");

    let err = routes::run_stage(State(state), Path("tarot".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
}
