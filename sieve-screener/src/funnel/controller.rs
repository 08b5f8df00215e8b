//! Funnel controller: chains steps as child executions.
//!
//! Each step runs under its own derived run id and a bounded timeout.
//! The chain stops at the first unsuccessful step; every result gathered
//! up to that point is kept in the returned [`FunnelRunResult`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sieve_common::logging::child_run_id;
use tracing::{error, info, warn};

use super::runner::{StageRunResult, StageRunner};
use super::stage::{Phase, StageParams, StageSpec};
use super::CancelToken;
use crate::store::{QualificationStore, RunAuditEntry, RunKind};

/// Anything the controller can chain.
#[async_trait]
pub trait FunnelStep: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(&self, params: StageParams) -> StageRunResult;
}

#[async_trait]
impl<S: StageSpec> FunnelStep for StageRunner<S> {
    fn phase(&self) -> Phase {
        StageRunner::phase(self)
    }

    async fn run(&self, params: StageParams) -> StageRunResult {
        StageRunner::run(self, params).await
    }
}

// ============================================================================
// Results
// ============================================================================

/// Input to a funnel run.
#[derive(Debug, Clone)]
pub struct FunnelParams {
    pub run_id: String,
    /// Skip steps before this phase; the first executed step then
    /// resolves its own candidates.
    pub start_from: Option<Phase>,
    pub cancel: CancelToken,
}

impl FunnelParams {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start_from: None,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelRunResult {
    pub run_id: String,
    pub success: bool,
    /// Results of every step that ran, in order
    pub stages: Vec<StageRunResult>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    /// Qualified output of the last completed step
    pub final_qualified: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl FunnelRunResult {
    pub fn stage(&self, phase: Phase) -> Option<&StageRunResult> {
        self.stages.iter().find(|s| s.phase == phase)
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct FunnelController {
    steps: Vec<Arc<dyn FunnelStep>>,
    stage_timeout: Duration,
    store: Option<Arc<dyn QualificationStore>>,
}

impl FunnelController {
    pub fn new(steps: Vec<Arc<dyn FunnelStep>>, stage_timeout: Duration) -> Self {
        Self {
            steps,
            stage_timeout,
            store: None,
        }
    }

    /// Record funnel results in the run audit.
    pub fn with_audit(mut self, store: Arc<dyn QualificationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.steps.iter().map(|s| s.phase()).collect()
    }

    pub fn step(&self, phase: Phase) -> Option<Arc<dyn FunnelStep>> {
        self.steps.iter().find(|s| s.phase() == phase).cloned()
    }

    /// Run the chain. Never fails; see `FunnelRunResult::success`.
    pub async fn run(&self, params: FunnelParams) -> FunnelRunResult {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(run_id = %params.run_id, steps = self.steps.len(), "Funnel run started");

        let mut stages = Vec::with_capacity(self.steps.len());
        let mut candidates: Option<Vec<String>> = None;
        let mut failure: Option<(Phase, String)> = None;

        let steps = self
            .steps
            .iter()
            .skip_while(|s| params.start_from.is_some_and(|start| s.phase() != start));

        for step in steps {
            let phase = step.phase();
            let child_id = child_run_id(&params.run_id, phase.as_str());

            if params.cancel.is_cancelled() {
                let result = StageRunResult::failed(phase, child_id, "funnel cancelled");
                failure = Some((phase, "funnel cancelled".to_string()));
                stages.push(result);
                break;
            }

            let child = StageParams {
                run_id: child_id.clone(),
                candidates: candidates.take(),
                cancel: params.cancel.clone(),
            };

            let result = match tokio::time::timeout(self.stage_timeout, step.run(child)).await {
                Ok(result) => result,
                Err(_) => {
                    let message = format!("timed out after {}s", self.stage_timeout.as_secs());
                    warn!(phase = %phase, run_id = %child_id, "Stage {message}");
                    StageRunResult::failed(phase, child_id, message)
                }
            };

            if !result.success {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "stage failed".to_string());
                failure = Some((phase, error));
                stages.push(result);
                break;
            }

            candidates = Some(result.qualified.clone());
            stages.push(result);
        }

        let (failed_phase, error) = match failure {
            Some((phase, error)) => (Some(phase), Some(format!("{phase}: {error}"))),
            None => (None, None),
        };
        let final_qualified = stages
            .iter()
            .rev()
            .find(|s| s.success)
            .map(|s| s.qualified.clone())
            .unwrap_or_default();

        let result = FunnelRunResult {
            run_id: params.run_id.clone(),
            success: failed_phase.is_none(),
            stages,
            failed_phase,
            error,
            final_qualified,
            started_at,
            completed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match result.failed_phase {
            None => info!(
                run_id = %result.run_id,
                stages = result.stages.len(),
                qualified = result.final_qualified.len(),
                duration_ms = result.duration_ms,
                "Funnel run complete"
            ),
            Some(phase) => error!(
                run_id = %result.run_id,
                failed_phase = %phase,
                error = result.error.as_deref().unwrap_or(""),
                "Funnel run stopped"
            ),
        }

        if let Some(ref store) = self.store {
            record_funnel_audit(store.as_ref(), &result).await;
        }
        result
    }
}

async fn record_funnel_audit(store: &dyn QualificationStore, result: &FunnelRunResult) {
    let document = match serde_json::to_value(result) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "Failed to encode funnel result for audit");
            return;
        }
    };
    let entry = RunAuditEntry::new(result.run_id.clone(), RunKind::Funnel, None, result.success, document);
    if let Err(e) = store.record_run(&entry).await {
        warn!(run_id = %result.run_id, error = %e, "Failed to record funnel audit");
    }
}
