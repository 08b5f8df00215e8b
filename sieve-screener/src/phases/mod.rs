//! The nine funnel phases and the wiring that chains them.
//!
//! Phases 1–8 are `StageSpec`s run by the generic `StageRunner`; the
//! recommendation step lives with the execution tracker.

pub mod config;
mod consistency;
mod fundamentals;
mod liquidity;
mod momentum;
mod portfolio;
mod risk;
mod setup;
mod universe;

pub use config::ScreenerConfig;
pub use consistency::{ConsistencyMetrics, ConsistencyStage};
pub use fundamentals::{FundamentalsMetrics, FundamentalsStage};
pub use liquidity::{LiquidityMetrics, LiquidityStage};
pub use momentum::{MomentumMetrics, MomentumStage};
pub use portfolio::{PortfolioInput, PortfolioMetrics, PortfolioStage};
pub use risk::{position_size, RiskMetrics, RiskStage};
pub use setup::{SetupMetrics, SetupStage};
pub use universe::{UniverseMetrics, UniverseStage};

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::data::{Candle, MarketDataProvider, ProviderError};
use crate::execution::{ExecutionTracker, RecommendationStep};
use crate::funnel::{FunnelController, FunnelStep, RetryPolicy, StageRunner, StageSpec};
use crate::store::{QualificationStore, SqliteStore};
use sieve_common::Config;

/// Daily candles for a symbol; an empty series counts as missing data.
pub(crate) async fn fetch_candles(
    provider: &dyn MarketDataProvider,
    symbol: &str,
    lookback_days: usize,
) -> Result<Vec<Candle>, ProviderError> {
    let candles = provider.get_daily_candles(symbol, lookback_days).await?;
    if candles.is_empty() {
        return Err(ProviderError::DataNotAvailable(format!("no candles for {symbol}")));
    }
    Ok(candles)
}

// ============================================================================
// Funnel Assembly
// ============================================================================

/// Shared pieces every stage runner is built from.
struct RunnerFactory {
    store: Arc<dyn QualificationStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    top_n: usize,
    audit: bool,
}

impl RunnerFactory {
    fn step<S: StageSpec>(&self, spec: S) -> Arc<dyn FunnelStep> {
        Arc::new(
            StageRunner::new(Arc::new(spec), self.store.clone(), self.breaker.clone(), self.retry.clone())
                .with_top_n(self.top_n)
                .with_audit(self.audit),
        )
    }
}

/// Build the full nine-step funnel.
pub fn build_funnel(
    config: &Config,
    screener: &ScreenerConfig,
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<SqliteStore>,
    tracker: Arc<ExecutionTracker>,
) -> FunnelController {
    let qualification: Arc<dyn QualificationStore> = store;
    let funnel = &config.funnel;

    // One breaker for the shared provider; it reopens after the first backoff.
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::with_name(provider.name())
            .failure_threshold(funnel.breaker_failure_threshold)
            .reset_timeout(Duration::from_millis(funnel.retry.initial_backoff_ms)),
    ));

    let factory = RunnerFactory {
        store: qualification.clone(),
        breaker,
        retry: RetryPolicy::from_config(&funnel.retry),
        top_n: funnel.top_n,
        audit: funnel.audit_enabled,
    };

    let execution = &config.execution;
    let steps: Vec<Arc<dyn FunnelStep>> = vec![
        factory.step(UniverseStage::new(provider.clone(), screener.universe.clone())),
        factory.step(MomentumStage::new(
            provider.clone(),
            screener.momentum.clone(),
            &screener.benchmark,
            screener.fallback_regime,
        )),
        factory.step(ConsistencyStage::new(provider.clone(), screener.consistency.clone())),
        factory.step(LiquidityStage::new(provider.clone(), screener.liquidity.clone())),
        factory.step(SetupStage::new(provider.clone(), screener.setup.clone())),
        factory.step(FundamentalsStage::new(provider.clone(), screener.fundamentals.clone())),
        factory.step(RiskStage::new(
            provider,
            qualification.clone(),
            screener.risk.clone(),
            execution.capital,
            execution.risk_per_trade_pct,
        )),
        factory.step(PortfolioStage::new(
            qualification.clone(),
            screener.portfolio.clone(),
            execution.capital,
        )),
        Arc::new(
            RecommendationStep::new(qualification.clone(), tracker).with_retry(factory.retry.clone()),
        ),
    ];

    info!(steps = steps.len(), "Funnel assembled");
    let controller = FunnelController::new(steps, Duration::from_secs(funnel.stage_timeout_secs));
    if funnel.audit_enabled {
        controller.with_audit(qualification)
    } else {
        controller
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{Datelike, NaiveDate, Weekday};

    use crate::data::{
        Candle, FundamentalSnapshot, Instrument, MarketDataProvider, ProviderError, QuarterlyResult,
        ShareholdingPattern,
    };

    /// In-memory provider with canned series.
    #[derive(Default)]
    pub struct MockProvider {
        pub instruments: Vec<Instrument>,
        pub candles: HashMap<String, Vec<Candle>>,
        pub fundamentals: HashMap<String, FundamentalSnapshot>,
        pub calls: AtomicU32,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_instrument(mut self, symbol: &str, series: &str, sector: Option<&str>) -> Self {
            self.instruments.push(Instrument {
                symbol: symbol.to_string(),
                name: symbol.to_string(),
                exchange: "NSE".to_string(),
                series: series.to_string(),
                isin: None,
                sector: sector.map(str::to_string),
            });
            self
        }

        pub fn with_candles(mut self, symbol: &str, candles: Vec<Candle>) -> Self {
            self.candles.insert(symbol.to_string(), candles);
            self
        }

        pub fn with_fundamentals(mut self, symbol: &str, snapshot: FundamentalSnapshot) -> Self {
            self.fundamentals.insert(symbol.to_string(), snapshot);
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn list_instruments(&self) -> Result<Vec<Instrument>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.instruments.clone())
        }

        async fn get_daily_candles(
            &self,
            symbol: &str,
            lookback_days: usize,
        ) -> Result<Vec<Candle>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let series = self
                .candles
                .get(symbol)
                .ok_or_else(|| ProviderError::DataNotAvailable(symbol.to_string()))?;
            let start = series.len().saturating_sub(lookback_days);
            Ok(series[start..].to_vec())
        }

        async fn get_quarterly_results(
            &self,
            symbol: &str,
            quarters: usize,
        ) -> Result<Vec<QuarterlyResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let snapshot = self
                .fundamentals
                .get(symbol)
                .ok_or_else(|| ProviderError::DataNotAvailable(symbol.to_string()))?;
            Ok(snapshot.quarters.iter().take(quarters).cloned().collect())
        }

        async fn get_shareholding(&self, symbol: &str) -> Result<ShareholdingPattern, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fundamentals
                .get(symbol)
                .map(|s| s.shareholding.clone())
                .ok_or_else(|| ProviderError::DataNotAvailable(symbol.to_string()))
        }
    }

    /// Weekday bars compounding at `daily_pct` with a small wobble.
    pub fn trending(bars: usize, start_price: f64, daily_pct: f64, volume: f64) -> Vec<Candle> {
        let mut date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap_or_default();
        let mut out = Vec::with_capacity(bars);
        let mut base = start_price;
        for i in 0..bars {
            while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                date = date.succ_opt().unwrap_or(date);
            }
            let wobble = if i % 2 == 0 { 1.003 } else { 0.997 };
            let close = base * wobble;
            out.push(Candle {
                date,
                open: close * 0.998,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume,
            });
            base *= 1.0 + daily_pct / 100.0;
            date = date.succ_opt().unwrap_or(date);
        }
        out
    }

    pub fn quarter(month_offset: u32, revenue: f64, operating_profit: f64, net_profit: f64) -> QuarterlyResult {
        QuarterlyResult {
            period_end: NaiveDate::from_ymd_opt(2026, 3, 31)
                .and_then(|d| d.checked_sub_months(chrono::Months::new(month_offset)))
                .unwrap_or_default(),
            revenue,
            operating_profit,
            net_profit,
        }
    }

    /// Eight quarters growing `growth_pct` a quarter, newest first.
    pub fn growing_company(growth_pct: f64, margin_pct: f64, promoter_pct: f64) -> FundamentalSnapshot {
        let quarters = (0..8u32)
            .map(|i| {
                let revenue = 1_000.0 / (1.0 + growth_pct / 100.0).powi(i as i32);
                let op = revenue * margin_pct / 100.0;
                quarter(i * 3, revenue, op, op * 0.7)
            })
            .collect();
        FundamentalSnapshot {
            quarters,
            shareholding: ShareholdingPattern {
                as_of: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap_or_default(),
                promoter_pct,
                pledged_pct: 0.0,
                institutional_pct: 20.0,
                prev_institutional_pct: Some(19.0),
            },
        }
    }
}
