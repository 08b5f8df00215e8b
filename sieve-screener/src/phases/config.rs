//! Per-phase screener configuration.
//!
//! Parsed from the `screener` section of the service config. Every field
//! has a default, so an empty or missing section yields a working funnel.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::funnel::{Regime, RegimeThresholds};
use sieve_common::validation::{collect_errors, Validate, ValidationError, ValidationResult};

/// Gates declared by each scored phase.
pub const UNIVERSE_GATES: usize = 4;
pub const MOMENTUM_GATES: usize = 5;
pub const CONSISTENCY_GATES: usize = 4;
pub const LIQUIDITY_GATES: usize = 4;
pub const SETUP_GATES: usize = 5;
pub const FUNDAMENTALS_GATES: usize = 7;
pub const RISK_GATES: usize = 4;
pub const PORTFOLIO_GATES: usize = 2;

// ============================================================================
// Screener Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Benchmark symbol used for regime detection
    #[serde(default = "default_benchmark")]
    pub benchmark: String,

    /// Regime assumed when detection fails
    #[serde(default)]
    pub fallback_regime: Regime,

    #[serde(default)]
    pub universe: UniverseConfig,

    #[serde(default)]
    pub momentum: MomentumConfig,

    #[serde(default)]
    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub liquidity: LiquidityConfig,

    #[serde(default)]
    pub setup: SetupConfig,

    #[serde(default)]
    pub fundamentals: FundamentalsConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub portfolio: PortfolioConfig,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            benchmark: default_benchmark(),
            fallback_regime: Regime::default(),
            universe: UniverseConfig::default(),
            momentum: MomentumConfig::default(),
            consistency: ConsistencyConfig::default(),
            liquidity: LiquidityConfig::default(),
            setup: SetupConfig::default(),
            fundamentals: FundamentalsConfig::default(),
            risk: RiskConfig::default(),
            portfolio: PortfolioConfig::default(),
        }
    }
}

impl ScreenerConfig {
    /// Parse the raw `screener` section. `null` gives the defaults.
    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).context("Invalid screener configuration")
    }
}

fn default_benchmark() -> String {
    "NIFTY50".to_string()
}

fn check_weights(field: &str, weights: &[f64]) -> ValidationResult<()> {
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(ValidationError::invalid(field, "weights must be non-negative numbers"));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > crate::funnel::scoring::WEIGHT_TOLERANCE {
        return Err(ValidationError::invalid(
            field,
            format!("weights sum to {sum:.4}, expected 1.0"),
        ));
    }
    Ok(())
}

fn check_minimum(field: &str, required: usize, gates: usize) -> ValidationResult<()> {
    crate::funnel::gate::validate_required_minimum(required, gates)
        .map_err(|reason| ValidationError::invalid(field, reason))
}

impl Validate for ScreenerConfig {
    fn validate(&self) -> ValidationResult<()> {
        let u = &self.universe;
        let m = &self.momentum;
        let c = &self.consistency;
        let l = &self.liquidity;
        let s = &self.setup;
        let f = &self.fundamentals;
        let r = &self.risk;
        let p = &self.portfolio;

        let mut results = vec![
            check_weights("screener.universe.weights", &u.weights.values()),
            check_minimum("screener.universe.required_minimum", u.required_minimum, UNIVERSE_GATES),
            check_weights("screener.momentum.weights", &m.weights.values()),
            check_minimum("screener.momentum.required_minimum", m.required_minimum, MOMENTUM_GATES),
            check_weights("screener.consistency.weights", &c.weights.values()),
            check_minimum(
                "screener.consistency.required_minimum",
                c.required_minimum,
                CONSISTENCY_GATES,
            ),
            check_weights("screener.liquidity.weights", &l.weights.values()),
            check_minimum("screener.liquidity.required_minimum", l.required_minimum, LIQUIDITY_GATES),
            check_weights("screener.setup.weights", &s.weights.values()),
            check_minimum("screener.setup.required_minimum", s.required_minimum, SETUP_GATES),
            check_weights("screener.fundamentals.weights", &f.weights.values()),
            check_minimum(
                "screener.fundamentals.required_minimum",
                f.required_minimum,
                FUNDAMENTALS_GATES,
            ),
            check_weights("screener.risk.weights", &r.weights.values()),
            check_minimum("screener.risk.required_minimum", r.required_minimum, RISK_GATES),
            check_weights("screener.portfolio.blend", &p.blend.values()),
            check_minimum("screener.portfolio.required_minimum", p.required_minimum, PORTFOLIO_GATES),
        ];

        if u.lookback_days < u.thresholds.min_trading_days {
            results.push(Err(ValidationError::invalid(
                "screener.universe.lookback_days",
                "must cover min_trading_days",
            )));
        }
        if m.lookback_days < 130 {
            results.push(Err(ValidationError::invalid(
                "screener.momentum.lookback_days",
                "needs at least 130 bars for the 6-month return",
            )));
        }
        if r.target_1_r <= 0.0 || r.target_2_r <= r.target_1_r {
            results.push(Err(ValidationError::invalid(
                "screener.risk",
                "targets must satisfy 0 < target_1_r < target_2_r",
            )));
        }
        if p.max_positions == 0 {
            results.push(Err(ValidationError::invalid(
                "screener.portfolio.max_positions",
                "must be at least 1",
            )));
        }
        collect_errors(results)
    }
}

// ============================================================================
// Universe
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default = "default_universe_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_universe_lookback")]
    pub lookback_days: usize,

    /// Trading series admitted from the instrument master
    #[serde(default = "default_series")]
    pub series: Vec<String>,

    /// Symbols never screened
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_universe_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: UniverseWeights,

    #[serde(default)]
    pub thresholds: UniverseThresholds,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_universe_delay(),
            lookback_days: default_universe_lookback(),
            series: default_series(),
            exclude: Vec::new(),
            required_minimum: default_universe_required(),
            weights: UniverseWeights::default(),
            thresholds: UniverseThresholds::default(),
        }
    }
}

fn default_universe_delay() -> u64 {
    50
}

fn default_universe_lookback() -> usize {
    60
}

fn default_series() -> Vec<String> {
    vec!["EQ".to_string()]
}

fn default_universe_required() -> usize {
    UNIVERSE_GATES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseWeights {
    pub turnover: f64,
    pub history: f64,
    pub activity: f64,
}

impl Default for UniverseWeights {
    fn default() -> Self {
        Self {
            turnover: 0.6,
            history: 0.2,
            activity: 0.2,
        }
    }
}

impl UniverseWeights {
    fn values(&self) -> Vec<f64> {
        vec![self.turnover, self.history, self.activity]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseThresholds {
    pub min_price: f64,
    pub max_price: f64,
    /// Average daily traded value
    pub min_avg_turnover: f64,
    pub min_trading_days: usize,
    pub max_zero_volume_days: usize,
}

impl Default for UniverseThresholds {
    fn default() -> Self {
        Self {
            min_price: 20.0,
            max_price: 100_000.0,
            min_avg_turnover: 10_000_000.0,
            min_trading_days: 50,
            max_zero_volume_days: 3,
        }
    }
}

// ============================================================================
// Momentum
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    #[serde(default = "default_candle_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_long_lookback")]
    pub lookback_days: usize,

    #[serde(default = "default_momentum_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: MomentumWeights,

    #[serde(default = "default_momentum_thresholds")]
    pub thresholds: RegimeThresholds<MomentumThresholds>,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_candle_delay(),
            lookback_days: default_long_lookback(),
            required_minimum: default_momentum_required(),
            weights: MomentumWeights::default(),
            thresholds: default_momentum_thresholds(),
        }
    }
}

fn default_candle_delay() -> u64 {
    100
}

fn default_long_lookback() -> usize {
    260
}

fn default_momentum_required() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumWeights {
    pub return_3m: f64,
    pub return_6m: f64,
    pub return_1m: f64,
    pub distance_from_high: f64,
    pub trend_alignment: f64,
}

impl Default for MomentumWeights {
    fn default() -> Self {
        Self {
            return_3m: 0.25,
            return_6m: 0.25,
            return_1m: 0.20,
            distance_from_high: 0.15,
            trend_alignment: 0.15,
        }
    }
}

impl MomentumWeights {
    fn values(&self) -> Vec<f64> {
        vec![
            self.return_3m,
            self.return_6m,
            self.return_1m,
            self.distance_from_high,
            self.trend_alignment,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumThresholds {
    pub min_return_3m: f64,
    pub min_return_6m: f64,
    /// Maximum distance below the 52-week high (%)
    pub max_distance_from_high: f64,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub min_percentile: f64,
}

fn default_momentum_thresholds() -> RegimeThresholds<MomentumThresholds> {
    RegimeThresholds {
        bullish: MomentumThresholds {
            min_return_3m: 5.0,
            min_return_6m: 10.0,
            max_distance_from_high: 15.0,
            rsi_min: 50.0,
            rsi_max: 80.0,
            min_percentile: 50.0,
        },
        sideways: MomentumThresholds {
            min_return_3m: 3.0,
            min_return_6m: 5.0,
            max_distance_from_high: 20.0,
            rsi_min: 45.0,
            rsi_max: 75.0,
            min_percentile: 60.0,
        },
        bearish: MomentumThresholds {
            min_return_3m: 0.0,
            min_return_6m: 0.0,
            max_distance_from_high: 25.0,
            rsi_min: 40.0,
            rsi_max: 70.0,
            min_percentile: 70.0,
        },
    }
}

// ============================================================================
// Consistency
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_candle_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_consistency_lookback")]
    pub lookback_days: usize,

    #[serde(default = "default_consistency_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: ConsistencyWeights,

    #[serde(default)]
    pub thresholds: ConsistencyThresholds,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_candle_delay(),
            lookback_days: default_consistency_lookback(),
            required_minimum: default_consistency_required(),
            weights: ConsistencyWeights::default(),
            thresholds: ConsistencyThresholds::default(),
        }
    }
}

fn default_consistency_lookback() -> usize {
    130
}

fn default_consistency_required() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyWeights {
    pub positive_weeks: f64,
    pub weekly_volatility: f64,
    pub drawdown: f64,
    pub trend_quality: f64,
}

impl Default for ConsistencyWeights {
    fn default() -> Self {
        Self {
            positive_weeks: 0.30,
            weekly_volatility: 0.25,
            drawdown: 0.20,
            trend_quality: 0.25,
        }
    }
}

impl ConsistencyWeights {
    fn values(&self) -> Vec<f64> {
        vec![
            self.positive_weeks,
            self.weekly_volatility,
            self.drawdown,
            self.trend_quality,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyThresholds {
    pub min_positive_weeks_pct: f64,
    pub max_weekly_volatility: f64,
    pub max_drawdown_pct: f64,
    pub min_trend_r2: f64,
}

impl Default for ConsistencyThresholds {
    fn default() -> Self {
        Self {
            min_positive_weeks_pct: 50.0,
            max_weekly_volatility: 6.0,
            max_drawdown_pct: 25.0,
            min_trend_r2: 0.5,
        }
    }
}

// ============================================================================
// Liquidity
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityConfig {
    #[serde(default = "default_candle_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_liquidity_lookback")]
    pub lookback_days: usize,

    #[serde(default = "default_liquidity_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: LiquidityWeights,

    #[serde(default)]
    pub thresholds: LiquidityThresholds,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_candle_delay(),
            lookback_days: default_liquidity_lookback(),
            required_minimum: default_liquidity_required(),
            weights: LiquidityWeights::default(),
            thresholds: LiquidityThresholds::default(),
        }
    }
}

fn default_liquidity_lookback() -> usize {
    60
}

fn default_liquidity_required() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityWeights {
    pub turnover: f64,
    pub stability: f64,
    pub spread: f64,
    pub volume_trend: f64,
}

impl Default for LiquidityWeights {
    fn default() -> Self {
        Self {
            turnover: 0.40,
            stability: 0.25,
            spread: 0.20,
            volume_trend: 0.15,
        }
    }
}

impl LiquidityWeights {
    fn values(&self) -> Vec<f64> {
        vec![self.turnover, self.stability, self.spread, self.volume_trend]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityThresholds {
    pub min_avg_turnover: f64,
    /// Coefficient of variation of daily turnover
    pub max_turnover_cv: f64,
    /// Average high-low range as % of close
    pub max_avg_range_pct: f64,
    /// Recent (20-bar) over longer-run average volume
    pub min_volume_trend: f64,
}

impl Default for LiquidityThresholds {
    fn default() -> Self {
        Self {
            min_avg_turnover: 50_000_000.0,
            max_turnover_cv: 1.0,
            max_avg_range_pct: 6.0,
            min_volume_trend: 0.7,
        }
    }
}

// ============================================================================
// Setup Detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_candle_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_liquidity_lookback")]
    pub lookback_days: usize,

    /// Bars defining the pivot high
    #[serde(default = "default_pivot_bars")]
    pub pivot_bars: usize,

    /// Width of the entry zone above the pivot (%)
    #[serde(default = "default_entry_buffer")]
    pub entry_buffer_pct: f64,

    /// Bars for the swing-low stop
    #[serde(default = "default_stop_lookback")]
    pub stop_lookback: usize,

    /// ATR multiple below the entry zone for the volatility stop
    #[serde(default = "default_stop_atr_multiple")]
    pub stop_atr_multiple: f64,

    #[serde(default = "default_setup_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: SetupWeights,

    #[serde(default)]
    pub thresholds: SetupThresholds,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_candle_delay(),
            lookback_days: default_liquidity_lookback(),
            pivot_bars: default_pivot_bars(),
            entry_buffer_pct: default_entry_buffer(),
            stop_lookback: default_stop_lookback(),
            stop_atr_multiple: default_stop_atr_multiple(),
            required_minimum: default_setup_required(),
            weights: SetupWeights::default(),
            thresholds: SetupThresholds::default(),
        }
    }
}

fn default_pivot_bars() -> usize {
    20
}

fn default_entry_buffer() -> f64 {
    1.0
}

fn default_stop_lookback() -> usize {
    10
}

fn default_stop_atr_multiple() -> f64 {
    1.5
}

fn default_setup_required() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupWeights {
    pub contraction: f64,
    pub dry_up: f64,
    pub proximity: f64,
    pub volatility: f64,
}

impl Default for SetupWeights {
    fn default() -> Self {
        Self {
            contraction: 0.30,
            dry_up: 0.25,
            proximity: 0.30,
            volatility: 0.15,
        }
    }
}

impl SetupWeights {
    fn values(&self) -> Vec<f64> {
        vec![self.contraction, self.dry_up, self.proximity, self.volatility]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupThresholds {
    /// ATR(5) / ATR(20)
    pub max_range_contraction: f64,
    /// Avg volume 5 bars / 50 bars
    pub max_volume_dry_up: f64,
    pub max_distance_to_pivot_pct: f64,
    pub max_atr_pct: f64,
    /// Stop distance below the entry zone (%)
    pub max_stop_pct: f64,
}

impl Default for SetupThresholds {
    fn default() -> Self {
        Self {
            max_range_contraction: 0.9,
            max_volume_dry_up: 0.9,
            max_distance_to_pivot_pct: 5.0,
            max_atr_pct: 5.0,
            max_stop_pct: 10.0,
        }
    }
}

// ============================================================================
// Fundamentals
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalsConfig {
    #[serde(default = "default_fundamentals_delay")]
    pub fetch_delay_ms: u64,

    /// Quarters requested; year-over-year needs at least five
    #[serde(default = "default_quarters")]
    pub quarters: usize,

    #[serde(default = "default_fundamentals_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: FundamentalsWeights,

    #[serde(default)]
    pub thresholds: FundamentalsThresholds,
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_fundamentals_delay(),
            quarters: default_quarters(),
            required_minimum: default_fundamentals_required(),
            weights: FundamentalsWeights::default(),
            thresholds: FundamentalsThresholds::default(),
        }
    }
}

fn default_fundamentals_delay() -> u64 {
    250
}

fn default_quarters() -> usize {
    8
}

fn default_fundamentals_required() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalsWeights {
    pub revenue_growth: f64,
    pub profit_growth: f64,
    pub operating_margin: f64,
    pub margin_trend: f64,
    pub promoter: f64,
    pub pledge: f64,
    pub institutional: f64,
}

impl Default for FundamentalsWeights {
    fn default() -> Self {
        Self {
            revenue_growth: 0.20,
            profit_growth: 0.25,
            operating_margin: 0.15,
            margin_trend: 0.10,
            promoter: 0.10,
            pledge: 0.10,
            institutional: 0.10,
        }
    }
}

impl FundamentalsWeights {
    fn values(&self) -> Vec<f64> {
        vec![
            self.revenue_growth,
            self.profit_growth,
            self.operating_margin,
            self.margin_trend,
            self.promoter,
            self.pledge,
            self.institutional,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalsThresholds {
    pub min_revenue_growth: f64,
    pub min_profit_growth: f64,
    pub min_operating_margin: f64,
    /// Largest tolerated drop in operating margin, percentage points
    pub max_margin_decline: f64,
    pub min_promoter_pct: f64,
    pub max_pledged_pct: f64,
    /// Largest tolerated drop in institutional holding, percentage points
    pub max_institutional_exit: f64,
}

impl Default for FundamentalsThresholds {
    fn default() -> Self {
        Self {
            min_revenue_growth: 10.0,
            min_profit_growth: 10.0,
            min_operating_margin: 10.0,
            max_margin_decline: 2.0,
            min_promoter_pct: 40.0,
            max_pledged_pct: 10.0,
            max_institutional_exit: 1.0,
        }
    }
}

// ============================================================================
// Risk Sizing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_candle_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_risk_lookback")]
    pub lookback_days: usize,

    /// First target in multiples of R
    #[serde(default = "default_target_1_r")]
    pub target_1_r: f64,

    #[serde(default = "default_target_2_r")]
    pub target_2_r: f64,

    #[serde(default = "default_risk_required")]
    pub required_minimum: usize,

    #[serde(default)]
    pub weights: RiskWeights,

    #[serde(default)]
    pub thresholds: RiskThresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            fetch_delay_ms: default_candle_delay(),
            lookback_days: default_risk_lookback(),
            target_1_r: default_target_1_r(),
            target_2_r: default_target_2_r(),
            required_minimum: default_risk_required(),
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

fn default_risk_lookback() -> usize {
    30
}

fn default_target_1_r() -> f64 {
    2.0
}

fn default_target_2_r() -> f64 {
    3.0
}

fn default_risk_required() -> usize {
    RISK_GATES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub stop_tightness: f64,
    pub extension: f64,
    pub capital_efficiency: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            stop_tightness: 0.5,
            extension: 0.3,
            capital_efficiency: 0.2,
        }
    }
}

impl RiskWeights {
    fn values(&self) -> Vec<f64> {
        vec![self.stop_tightness, self.extension, self.capital_efficiency]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Stop distance as % of entry
    pub max_stop_pct: f64,
    pub min_shares: u64,
    /// Position value as % of capital
    pub max_position_pct: f64,
    /// Last close above the entry zone (%)
    pub max_extension_pct: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            max_stop_pct: 8.0,
            min_shares: 1,
            max_position_pct: 20.0,
            max_extension_pct: 3.0,
        }
    }
}

// ============================================================================
// Portfolio Construction
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    #[serde(default = "default_max_per_sector")]
    pub max_per_sector: usize,

    /// Share of capital the book may deploy (%)
    #[serde(default = "default_max_capital_pct")]
    pub max_capital_pct: f64,

    #[serde(default = "default_min_blended_score")]
    pub min_blended_score: f64,

    #[serde(default = "default_portfolio_required")]
    pub required_minimum: usize,

    /// Weight of each upstream phase in the blended score
    #[serde(default)]
    pub blend: BlendWeights,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            max_per_sector: default_max_per_sector(),
            max_capital_pct: default_max_capital_pct(),
            min_blended_score: default_min_blended_score(),
            required_minimum: default_portfolio_required(),
            blend: BlendWeights::default(),
        }
    }
}

fn default_max_positions() -> usize {
    8
}

fn default_max_per_sector() -> usize {
    2
}

fn default_max_capital_pct() -> f64 {
    100.0
}

fn default_min_blended_score() -> f64 {
    50.0
}

fn default_portfolio_required() -> usize {
    PORTFOLIO_GATES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendWeights {
    pub momentum: f64,
    pub consistency: f64,
    pub liquidity: f64,
    pub setup: f64,
    pub fundamentals: f64,
    pub risk: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            momentum: 0.25,
            consistency: 0.15,
            liquidity: 0.10,
            setup: 0.15,
            fundamentals: 0.20,
            risk: 0.15,
        }
    }
}

impl BlendWeights {
    fn values(&self) -> Vec<f64> {
        vec![
            self.momentum,
            self.consistency,
            self.liquidity,
            self.setup,
            self.fundamentals,
            self.risk,
        ]
    }
}
