//! Configuration management for Sieve services.
//!
//! All Sieve services share a single configuration file at `~/.sieve/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (SIEVE_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `SIEVE_LOG_LEVEL` → observability.log_level
//! - `SIEVE_LOG_FORMAT` → observability.log_format
//! - `SIEVE_DB_PATH` → storage.db_path
//! - `SIEVE_BIND_ADDRESS` → server.host
//! - `SIEVE_PORT` → server.port
//! - `SIEVE_PROVIDER_URL` → provider.base_url
//! - `SIEVE_PROVIDER_API_KEY` → provider.api_key
//!
//! The `screener` section is deliberately untyped here: it carries the
//! per-phase thresholds, weights and delays, and is parsed by the screener
//! service into its own strongly typed configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from(".sieve"), |dirs| dirs.home_dir().join(".sieve"))
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure for all Sieve services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Qualification store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Market data provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Funnel engine settings shared by every phase
    #[serde(default)]
    pub funnel: FunnelConfig,

    /// Execution tracker settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Cron schedules
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Per-phase screener parameters (parsed by the screener service)
    #[serde(default)]
    pub screener: serde_json::Value,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SIEVE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("SIEVE_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("SIEVE_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Ok(host) = std::env::var("SIEVE_BIND_ADDRESS") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SIEVE_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(url) = std::env::var("SIEVE_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Ok(key) = std::env::var("SIEVE_PROVIDER_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Socket address string for the HTTP server.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to clamp to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Storage
// ============================================================================

/// Qualification store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (`~/` is expanded)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Number of run audit rows to keep
    #[serde(default = "default_audit_retention")]
    pub audit_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            audit_retention: default_audit_retention(),
        }
    }
}

fn default_db_path() -> String {
    "~/.sieve/sieve.db".to_string()
}

fn default_audit_retention() -> usize {
    500
}

// ============================================================================
// Provider
// ============================================================================

/// Market data provider configuration.
///
/// Paths are appended to `base_url`; `{symbol}` is substituted per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_instruments_path")]
    pub instruments_path: String,

    #[serde(default = "default_candles_path")]
    pub candles_path: String,

    #[serde(default = "default_results_path")]
    pub results_path: String,

    #[serde(default = "default_shareholding_path")]
    pub shareholding_path: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            api_key: None,
            timeout_secs: default_provider_timeout(),
            instruments_path: default_instruments_path(),
            candles_path: default_candles_path(),
            results_path: default_results_path(),
            shareholding_path: default_shareholding_path(),
        }
    }
}

fn default_provider_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_instruments_path() -> String {
    "/instruments.json.gz".to_string()
}

fn default_candles_path() -> String {
    "/candles/{symbol}".to_string()
}

fn default_results_path() -> String {
    "/fundamentals/{symbol}/quarterly".to_string()
}

fn default_shareholding_path() -> String {
    "/fundamentals/{symbol}/shareholding".to_string()
}

// ============================================================================
// Server
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4480
}

// ============================================================================
// Funnel
// ============================================================================

/// Settings shared by every funnel phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Upper bound for one child stage execution, in seconds
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Whole-step retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Number of top records included in run summaries
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Consecutive transient fetch failures that abort a batch
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,

    /// Persist every run summary to the audit table
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout(),
            retry: RetryConfig::default(),
            top_n: default_top_n(),
            breaker_failure_threshold: default_breaker_threshold(),
            audit_enabled: true,
        }
    }
}

fn default_stage_timeout() -> u64 {
    60 * 60
}

fn default_top_n() -> usize {
    10
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Exponential backoff applied to a whole step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

// ============================================================================
// Execution
// ============================================================================

/// Execution tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Trading capital used for sizing
    #[serde(default = "default_capital")]
    pub capital: f64,

    /// Capital risked per trade (%)
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,

    /// Days a recommendation stays valid
    #[serde(default = "default_recommendation_ttl_days")]
    pub recommendation_ttl_days: i64,

    /// Days after which a finished position is archived
    #[serde(default = "default_max_holding_days")]
    pub max_holding_days: i64,

    /// Prices above `entry_high * (1 + chase_limit_pct / 100)` are skipped
    #[serde(default = "default_chase_limit_pct")]
    pub chase_limit_pct: f64,

    /// Gaps below this percentage (negative) mean wait instead of entering at open
    #[serde(default = "default_gap_wait_pct")]
    pub gap_wait_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            capital: default_capital(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
            recommendation_ttl_days: default_recommendation_ttl_days(),
            max_holding_days: default_max_holding_days(),
            chase_limit_pct: default_chase_limit_pct(),
            gap_wait_pct: default_gap_wait_pct(),
        }
    }
}

fn default_capital() -> f64 {
    1_000_000.0
}

fn default_risk_per_trade_pct() -> f64 {
    1.0
}

fn default_recommendation_ttl_days() -> i64 {
    7
}

fn default_max_holding_days() -> i64 {
    60
}

fn default_chase_limit_pct() -> f64 {
    2.0
}

fn default_gap_wait_pct() -> f64 {
    -2.0
}

// ============================================================================
// Schedule
// ============================================================================

/// Cron schedules (seconds-resolution expressions, as the `cron` crate expects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Full funnel run
    #[serde(default = "default_funnel_cron")]
    pub funnel_cron: String,

    /// Recommendation expiry sweep
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,

    /// Position price poll
    #[serde(default = "default_poll_cron")]
    pub poll_cron: String,

    /// How often the scheduler loop checks for due tasks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            funnel_cron: default_funnel_cron(),
            sweep_cron: default_sweep_cron(),
            poll_cron: default_poll_cron(),
            check_interval_secs: default_check_interval(),
        }
    }
}

fn default_funnel_cron() -> String {
    "0 0 18 * * Mon-Fri".to_string()
}

fn default_sweep_cron() -> String {
    "0 30 8 * * *".to_string()
}

fn default_poll_cron() -> String {
    "0 */15 9-15 * * Mon-Fri".to_string()
}

fn default_check_interval() -> u64 {
    10
}

// ============================================================================
// Tests
// ============================================================================
