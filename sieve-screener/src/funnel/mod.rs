//! Qualification funnel engine.
//!
//! The generic machinery every phase runs on:
//! - `scoring`: two-pass population scoring and percentile ranks
//! - `gate`: N-of-M predicate gates
//! - `retry`: exponential backoff for stage steps
//! - `stage`: the `StageSpec` trait, phases and persisted records
//! - `runner`: the fetch → score → gate → persist state machine
//! - `controller`: chaining steps as child executions with timeouts
//! - `regime`: benchmark regime detection and regime-keyed thresholds

mod cancel;
pub mod controller;
pub mod gate;
pub mod regime;
pub mod retry;
pub mod runner;
pub mod scoring;
pub mod stage;

pub use cancel::CancelToken;
pub use controller::{FunnelController, FunnelParams, FunnelRunResult, FunnelStep};
pub use gate::{GateOutcome, GateResult, Predicate};
pub use regime::{Regime, RegimeDetector, RegimeThresholds};
pub use retry::{RetryPolicy, StepError};
pub use runner::{RecordSummary, StageRunResult, StageRunner, StageState, StageTransition};
pub use scoring::{ComponentScore, Normalization, ScoreCard, ScoreComponent};
pub use stage::{CandidateSource, Phase, Scored, StageParams, StageRecord, StageSpec};
