//! Sieve Screener Library
//!
//! A nine-phase qualification funnel that narrows a listed-equity
//! universe down to a handful of sized trade ideas, plus the tracker that
//! follows those ideas once approved.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                   sieve-screener (Rust Service)                     │
//! │                              :4480                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │  Market Data    │  │  Funnel         │  │  Execution      │      │
//! │  │  Provider       │─▶│  Controller     │─▶│  Tracker        │      │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────────┘      │
//! │                                ▼                                    │
//! │                    ┌───────────────────────┐                        │
//! │                    │  Qualification Store  │                        │
//! │                    └───────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Phases
//!
//! Universe → Momentum → Consistency → Liquidity → Setup → Fundamentals →
//! Risk Sizing → Portfolio → Recommendation. Each phase reads the previous
//! phase's qualified records and replaces its own records wholesale.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod circuit_breaker;
pub mod data;
pub mod execution;
pub mod funnel;
pub mod phases;
pub mod routes;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use sieve_common::logging::{child_run_id, generate_run_id};
use sieve_common::util::expand_home;
use sieve_common::{Config, Validate};
use tracing::{info, warn};

use crate::data::{HttpMarketDataProvider, MarketDataProvider};
use crate::execution::ExecutionTracker;
use crate::funnel::{FunnelController, FunnelParams, FunnelRunResult, Phase, StageParams, StageRunResult};
use crate::phases::{build_funnel, ScreenerConfig};
use crate::scheduler::{FunnelScheduler, RunGuard};
use crate::store::SqliteStore;

/// Screener service state
pub struct ScreenerState {
    pub config: Config,
    pub screener: ScreenerConfig,
    pub provider: Arc<dyn MarketDataProvider>,
    pub store: Arc<SqliteStore>,
    pub tracker: Arc<ExecutionTracker>,
    pub funnel: FunnelController,
    /// Held while a funnel or stage run is in progress
    pub runs: RunGuard,
}

impl ScreenerState {
    /// Build state from configuration: HTTP provider and on-disk store.
    pub fn new(config: Config) -> Result<Self> {
        let provider: Arc<dyn MarketDataProvider> = Arc::new(HttpMarketDataProvider::new(config.provider.clone()));
        let db_path = expand_home(&config.storage.db_path);
        let store = Arc::new(
            SqliteStore::open(&db_path, config.storage.audit_retention)
                .with_context(|| format!("Failed to open store at {}", db_path.display()))?,
        );
        Self::with_parts(config, provider, store)
    }

    /// Build state around an existing provider and store.
    pub fn with_parts(config: Config, provider: Arc<dyn MarketDataProvider>, store: Arc<SqliteStore>) -> Result<Self> {
        let screener = ScreenerConfig::from_value(&config.screener)?;
        screener
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Invalid screener configuration")?;

        let tracker = Arc::new(ExecutionTracker::new(store.clone(), config.execution.clone()));
        let funnel = build_funnel(&config, &screener, provider.clone(), store.clone(), tracker.clone());

        Ok(Self {
            config,
            screener,
            provider,
            store,
            tracker,
            funnel,
            runs: RunGuard::new(),
        })
    }

    /// Run the whole funnel, optionally starting at a later phase.
    ///
    /// Rejected with `Conflict` while another run holds the guard.
    pub async fn run_funnel(&self, start_from: Option<Phase>) -> sieve_common::Result<FunnelRunResult> {
        let _permit = self
            .runs
            .try_acquire()
            .ok_or_else(|| sieve_common::Error::Conflict("a funnel run is already in progress".into()))?;

        let mut params = FunnelParams::new(generate_run_id());
        params.start_from = start_from;
        Ok(self.funnel.run(params).await)
    }

    /// Run one phase standalone against its upstream's current records.
    pub async fn run_stage(&self, phase: Phase) -> sieve_common::Result<StageRunResult> {
        let step = self
            .funnel
            .step(phase)
            .ok_or_else(|| sieve_common::Error::NotFound(format!("no step for phase {phase}")))?;
        let _permit = self
            .runs
            .try_acquire()
            .ok_or_else(|| sieve_common::Error::Conflict("a funnel run is already in progress".into()))?;

        let run_id = child_run_id(&generate_run_id(), phase.as_str());
        Ok(step.run(StageParams::standalone(run_id)).await)
    }
}

/// Main screener service
pub struct ScreenerService {
    state: Arc<ScreenerState>,
}

impl ScreenerService {
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(ScreenerState::new(config)?);
        Ok(Self { state })
    }

    pub fn state(&self) -> Arc<ScreenerState> {
        self.state.clone()
    }

    /// Start the scheduler and serve HTTP until the listener closes.
    pub async fn start(self) -> Result<()> {
        let scheduler = FunnelScheduler::new(self.state.config.schedule.clone(), self.state.clone())?;
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                tracing::error!(error = %e, "Scheduler stopped with error");
            }
        });

        if let Err(e) = self.state.provider.health_check().await {
            warn!(provider = self.state.provider.name(), error = %e, "Market data provider not reachable");
        }

        let app = routes::build_router(self.state.clone());
        let addr = self.state.config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(address = %addr, "Starting HTTP server");

        axum::serve(listener, app).await?;
        Ok(())
    }
}
