//! Integration tests for chaining real stage runners.
//!
//! A failing middle stage stops the chain, keeps everything computed so
//! far, and leaves later phases untouched.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use sieve_screener::circuit_breaker::CircuitBreaker;
use sieve_screener::data::ProviderError;
use sieve_screener::funnel::gate::at_least;
use sieve_screener::funnel::{
    FunnelController, FunnelParams, FunnelStep, Normalization, Phase, Predicate, RetryPolicy, ScoreCard,
    ScoreComponent, StageRunner, StageSpec, StageState,
};
use sieve_screener::store::{QualificationStore, RecordFilter, RunKind, SqliteStore};

#[derive(Debug, Serialize)]
struct Size {
    value: f64,
}

/// Scores symbols by name length; prepare can be made to fail.
struct ChainStage {
    phase: Phase,
    broken: bool,
    prepares: AtomicU32,
    fetches: AtomicU32,
}

impl ChainStage {
    fn new(phase: Phase, broken: bool) -> Arc<Self> {
        Arc::new(Self {
            phase,
            broken,
            prepares: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StageSpec for ChainStage {
    type Payload = f64;
    type Metrics = Size;
    type Thresholds = f64;
    type Context = ();

    fn phase(&self) -> Phase {
        self.phase
    }

    async fn discover(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["ALPHA".into(), "BETA".into(), "GAMMA".into(), "PI".into()])
    }

    fn fetch_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn required_minimum(&self) -> usize {
        1
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            anyhow::bail!("reference data unavailable");
        }
        Ok(())
    }

    async fn fetch_one(&self, symbol: &str, _ctx: &()) -> Result<f64, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(symbol.len() as f64)
    }

    fn measure(&self, _symbol: &str, value: &f64, _ctx: &()) -> Option<Size> {
        Some(Size { value: *value })
    }

    fn components(&self) -> Vec<ScoreComponent<Size>> {
        vec![ScoreComponent::new("size", 1.0, Normalization::MinMax, |m: &Size| m.value)]
    }

    fn thresholds(&self, _ctx: &()) -> f64 {
        4.0
    }

    fn predicates(&self) -> Vec<Predicate<Size, f64>> {
        vec![Predicate::new("long_name", |m: &Size, _: &ScoreCard, t: &f64| at_least(m.value, *t))]
    }
}

fn step(spec: Arc<ChainStage>, store: Arc<SqliteStore>) -> Arc<dyn FunnelStep> {
    Arc::new(StageRunner::new(
        spec,
        store,
        Arc::new(CircuitBreaker::with_name("chain")),
        RetryPolicy::immediate(3),
    ))
}

#[tokio::test]
async fn test_chain_stops_at_failing_stage() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = ChainStage::new(Phase::Universe, false);
    let second = ChainStage::new(Phase::Momentum, true);
    let third = ChainStage::new(Phase::Consistency, false);

    let controller = FunnelController::new(
        vec![
            step(first.clone(), store.clone()),
            step(second.clone(), store.clone()),
            step(third.clone(), store.clone()),
        ],
        Duration::from_secs(5),
    )
    .with_audit(store.clone());

    let result = controller.run(FunnelParams::new("chain")).await;

    assert!(!result.success);
    assert_eq!(result.failed_phase, Some(Phase::Momentum));
    assert!(result.error.as_deref().unwrap().contains("reference data unavailable"));
    assert_eq!(result.stages.len(), 2);

    // First stage completed and its qualified list is kept
    let universe = &result.stages[0];
    assert!(universe.success);
    assert_eq!(universe.run_id, "chain:universe");
    assert_eq!(universe.total_qualified, 3);
    assert!(!universe.qualified.contains(&"PI".to_string()));
    assert_eq!(result.final_qualified, universe.qualified);

    // Second stage retried prepare to exhaustion and never fetched
    let momentum = &result.stages[1];
    assert_eq!(momentum.state(), Some(StageState::Failed));
    assert_eq!(momentum.total_input, 3);
    assert_eq!(second.prepares.load(Ordering::SeqCst), 3);
    assert_eq!(second.fetches.load(Ordering::SeqCst), 0);

    // Third stage never ran
    assert_eq!(third.prepares.load(Ordering::SeqCst), 0);

    let universe_count = store.count(Phase::Universe, &RecordFilter::default()).await.unwrap();
    let momentum_count = store.count(Phase::Momentum, &RecordFilter::default()).await.unwrap();
    assert_eq!(universe_count, 4);
    assert_eq!(momentum_count, 0);

    let audit = store.recent_runs(10).await.unwrap();
    assert_eq!(audit.len(), 3);
    assert_eq!(audit[0].kind, RunKind::Funnel);
    assert!(!audit[0].success);
    assert!(audit.iter().any(|e| e.phase == Some(Phase::Momentum) && !e.success));
}

#[tokio::test]
async fn test_start_from_resolves_from_store() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let first = ChainStage::new(Phase::Universe, false);
    let second = ChainStage::new(Phase::Momentum, false);
    let controller = FunnelController::new(
        vec![step(first.clone(), store.clone()), step(second.clone(), store.clone())],
        Duration::from_secs(5),
    );

    assert!(controller.run(FunnelParams::new("full")).await.success);
    assert_eq!(first.fetches.load(Ordering::SeqCst), 4);

    let mut params = FunnelParams::new("resume");
    params.start_from = Some(Phase::Momentum);
    let resumed = controller.run(params).await;

    assert!(resumed.success);
    assert_eq!(resumed.stages.len(), 1);
    // Candidates come from the stored qualified universe records
    assert_eq!(resumed.stages[0].total_input, 3);
    assert_eq!(first.fetches.load(Ordering::SeqCst), 4);
}
