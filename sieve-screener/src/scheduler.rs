//! Cron scheduler for the funnel and the execution tracker.
//!
//! Three schedules drive the service without an operator:
//!
//! - `funnel_cron`: full funnel run after the close
//! - `sweep_cron`: pre-open expiry sweep and gap check of approved cards
//! - `poll_cron`: position price poll during market hours
//!
//! # Schedule Configuration
//!
//! ```json
//! {
//!   "schedule": {
//!     "enabled": true,
//!     "funnel_cron": "0 0 18 * * Mon-Fri",
//!     "sweep_cron": "0 30 8 * * *",
//!     "poll_cron": "0 */15 9-15 * * Mon-Fri"
//!   }
//! }
//! ```
//!
//! Funnel runs are single-flight: a trigger that arrives while another
//! run holds the [`RunGuard`] is skipped, whether it came from cron or HTTP.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use sieve_common::ScheduleConfig;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::ScreenerState;

/// Consecutive failures of one task before an alert is logged.
const ALERT_THRESHOLD: u32 = 3;

// ============================================================================
// Single-flight Guard
// ============================================================================

/// At most one run at a time.
#[derive(Debug, Default)]
pub struct RunGuard {
    busy: AtomicBool,
}

/// Releases the guard on drop.
#[derive(Debug)]
pub struct RunPermit<'a> {
    guard: &'a RunGuard,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` when a run is already in progress.
    pub fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Scheduled task type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledTask {
    FunnelRun,
    /// Expire stale recommendations, then gap-check approved ones
    ExpirySweep,
    PositionPoll,
}

impl ScheduledTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FunnelRun => "funnel_run",
            Self::ExpirySweep => "expiry_sweep",
            Self::PositionPoll => "position_poll",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

struct ParsedSchedule {
    task: ScheduledTask,
    schedule: Schedule,
}

/// Parse the configured cron expressions. Empty when scheduling is disabled.
fn parse_schedules(config: &ScheduleConfig) -> Result<Vec<ParsedSchedule>> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    [
        (ScheduledTask::FunnelRun, &config.funnel_cron),
        (ScheduledTask::ExpirySweep, &config.sweep_cron),
        (ScheduledTask::PositionPoll, &config.poll_cron),
    ]
    .into_iter()
    .map(|(task, expr)| {
        let schedule = Schedule::from_str(expr)
            .with_context(|| format!("Invalid {} cron: {}", task.name(), expr))?;
        Ok(ParsedSchedule { task, schedule })
    })
    .collect()
}

/// Whether a fire time fell in the last minute and has not been handled yet.
fn is_due(schedule: &Schedule, last_exec: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let after = last_exec.unwrap_or_else(|| now - chrono::Duration::hours(1));

    for scheduled in schedule.after(&after).take(10) {
        if scheduled > now {
            break;
        }
        if now.signed_duration_since(scheduled) >= chrono::Duration::seconds(60) {
            continue;
        }
        if last_exec.is_some_and(|last| last >= scheduled) {
            continue;
        }
        return true;
    }
    false
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct FunnelScheduler {
    config: ScheduleConfig,
    state: Arc<ScreenerState>,
    scheduler_state: RwLock<SchedulerState>,
    schedules: Vec<ParsedSchedule>,
    last_executions: RwLock<HashMap<ScheduledTask, DateTime<Utc>>>,
    failure_counts: RwLock<HashMap<ScheduledTask, u32>>,
}

impl FunnelScheduler {
    pub fn new(config: ScheduleConfig, state: Arc<ScreenerState>) -> Result<Self> {
        let schedules = parse_schedules(&config)?;
        if config.enabled {
            info!(
                funnel = %config.funnel_cron,
                sweep = %config.sweep_cron,
                poll = %config.poll_cron,
                "Scheduler configured"
            );
        }

        Ok(Self {
            config,
            state,
            scheduler_state: RwLock::new(SchedulerState::Stopped),
            schedules,
            last_executions: RwLock::new(HashMap::new()),
            failure_counts: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_state(&self) -> SchedulerState {
        *self.scheduler_state.read().await
    }

    pub async fn stop(&self) {
        *self.scheduler_state.write().await = SchedulerState::Stopped;
        info!("Scheduler stopped");
    }

    pub async fn pause(&self) {
        *self.scheduler_state.write().await = SchedulerState::Paused;
        info!("Scheduler paused");
    }

    pub async fn resume(&self) {
        *self.scheduler_state.write().await = SchedulerState::Running;
        info!("Scheduler resumed");
    }

    /// Run the scheduler loop until stopped.
    pub async fn run(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler disabled, not starting");
            return Ok(());
        }

        *self.scheduler_state.write().await = SchedulerState::Running;
        info!("Scheduler started");

        let mut check_interval = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        loop {
            check_interval.tick().await;

            match *self.scheduler_state.read().await {
                SchedulerState::Stopped => break,
                SchedulerState::Paused => continue,
                SchedulerState::Running => self.check_and_execute(Utc::now()).await,
            }
        }
        Ok(())
    }

    async fn check_and_execute(&self, now: DateTime<Utc>) {
        for parsed in &self.schedules {
            let last = self.last_executions.read().await.get(&parsed.task).copied();
            if is_due(&parsed.schedule, last, now) {
                self.execute_task(parsed.task).await;
            }
        }
    }

    /// Execute one task and track its failures.
    pub async fn execute_task(&self, task: ScheduledTask) {
        info!(task = task.name(), "Executing scheduled task");
        self.last_executions.write().await.insert(task, Utc::now());

        let result = match task {
            ScheduledTask::FunnelRun => self.handle_funnel_run().await,
            ScheduledTask::ExpirySweep => self.handle_expiry_sweep().await,
            ScheduledTask::PositionPoll => self.handle_position_poll().await,
        };

        match result {
            Ok(()) => {
                self.failure_counts.write().await.insert(task, 0);
            }
            Err(e) => {
                error!(task = task.name(), error = %e, "Scheduled task failed");
                self.track_failure(task).await;
            }
        }
    }

    async fn track_failure(&self, task: ScheduledTask) {
        let mut failures = self.failure_counts.write().await;
        let count = failures.entry(task).or_insert(0);
        *count += 1;

        if *count >= ALERT_THRESHOLD {
            error!(
                task = task.name(),
                failure_count = *count,
                threshold = ALERT_THRESHOLD,
                "ALERT: Task failure threshold exceeded"
            );
            *count = 0;
        }
    }

    async fn handle_funnel_run(&self) -> Result<()> {
        if self.state.runs.is_busy() {
            warn!("Funnel run already in progress, skipping scheduled run");
            return Ok(());
        }

        match self.state.run_funnel(None).await {
            Ok(result) if result.success => {
                info!(
                    run_id = %result.run_id,
                    final_qualified = result.final_qualified.len(),
                    duration_ms = result.duration_ms,
                    "Scheduled funnel run complete"
                );
                Ok(())
            }
            Ok(result) => Err(anyhow::anyhow!(
                "funnel run {} failed at {:?}: {}",
                result.run_id,
                result.failed_phase,
                result.error.unwrap_or_default()
            )),
            Err(sieve_common::Error::Conflict(msg)) => {
                warn!(reason = %msg, "Scheduled funnel run skipped");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }

    async fn handle_expiry_sweep(&self) -> Result<()> {
        let expired = self.state.tracker.sweep_expired(Utc::now()).await?;
        let gaps = self.state.tracker.run_gap_check(self.state.provider.as_ref()).await?;
        info!(expired, gap_checked = gaps.len(), "Expiry sweep complete");
        Ok(())
    }

    async fn handle_position_poll(&self) -> Result<()> {
        let updated = self
            .state
            .tracker
            .poll_positions(self.state.provider.as_ref(), Utc::now())
            .await?;
        debug!(updated = updated.len(), "Position poll complete");
        Ok(())
    }

    /// Next fire time of every task, soonest first.
    pub fn next_schedules(&self) -> Vec<(ScheduledTask, DateTime<Utc>)> {
        let mut next_times: Vec<_> = self
            .schedules
            .iter()
            .filter_map(|p| p.schedule.upcoming(Utc).next().map(|next| (p.task, next)))
            .collect();
        next_times.sort_by_key(|(_, time)| *time);
        next_times
    }
}
