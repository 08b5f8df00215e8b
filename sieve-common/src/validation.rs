//! Configuration validation for Sieve services.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use std::str::FromStr;
use thiserror::Error;

use crate::config::{
    Config, ExecutionConfig, FunnelConfig, ObservabilityConfig, ProviderConfig, RetryConfig,
    ScheduleConfig, ServerConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Shorthand for an `InvalidValue` error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

/// Fold a list of section results into one.
pub fn collect_errors(results: Vec<ValidationResult<()>>) -> ValidationResult<()> {
    let mut errors: Vec<ValidationError> = results.into_iter().filter_map(Result::err).collect();

    if errors.is_empty() {
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ValidationError::Multiple(errors))
    }
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        collect_errors(vec![
            self.observability.validate(),
            self.server.validate(),
            self.provider.validate(),
            self.funnel.validate(),
            self.execution.validate(),
            self.schedule.validate(),
        ])
    }

    /// Load (with env overrides) and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::invalid(
                "observability.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::invalid(
                "observability.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        Ok(())
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "server.port".into(),
            });
        }
        if self.host.is_empty() {
            return Err(ValidationError::MissingField {
                field: "server.host".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ProviderConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.base_url.is_empty() {
            return Err(ValidationError::MissingField {
                field: "provider.base_url".into(),
            });
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ValidationError::invalid(
                "provider.base_url",
                "must start with http:// or https://",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::invalid(
                "provider.timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                "funnel.retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ValidationError::invalid(
                "funnel.retry.multiplier",
                "must be >= 1.0",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::invalid(
                "funnel.retry.initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        Ok(())
    }
}

impl Validate for FunnelConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.stage_timeout_secs == 0 {
            return Err(ValidationError::invalid(
                "funnel.stage_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ValidationError::invalid(
                "funnel.breaker_failure_threshold",
                "must be at least 1",
            ));
        }
        self.retry.validate()
    }
}

impl Validate for ExecutionConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.capital <= 0.0 {
            return Err(ValidationError::invalid(
                "execution.capital",
                "must be positive",
            ));
        }
        if !(self.risk_per_trade_pct > 0.0 && self.risk_per_trade_pct <= 10.0) {
            return Err(ValidationError::invalid(
                "execution.risk_per_trade_pct",
                "must be in (0, 10]",
            ));
        }
        if self.recommendation_ttl_days <= 0 {
            return Err(ValidationError::invalid(
                "execution.recommendation_ttl_days",
                "must be positive",
            ));
        }
        if self.max_holding_days <= 0 {
            return Err(ValidationError::invalid(
                "execution.max_holding_days",
                "must be positive",
            ));
        }
        if self.gap_wait_pct >= 0.0 {
            return Err(ValidationError::invalid(
                "execution.gap_wait_pct",
                "must be negative",
            ));
        }
        Ok(())
    }
}

impl Validate for ScheduleConfig {
    fn validate(&self) -> ValidationResult<()> {
        for (field, expr) in [
            ("schedule.funnel_cron", &self.funnel_cron),
            ("schedule.sweep_cron", &self.sweep_cron),
            ("schedule.poll_cron", &self.poll_cron),
        ] {
            if cron::Schedule::from_str(expr).is_err() {
                return Err(ValidationError::invalid(
                    field,
                    format!("invalid cron expression: {expr}"),
                ));
            }
        }
        if self.check_interval_secs == 0 {
            return Err(ValidationError::invalid(
                "schedule.check_interval_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("info", "json" => true ; "defaults")]
    #[test_case("DEBUG", "Pretty" => true ; "case insensitive")]
    #[test_case("verbose", "json" => false ; "unknown level")]
    #[test_case("warn", "xml" => false ; "unknown format")]
    fn test_observability(level: &str, format: &str) -> bool {
        ObservabilityConfig {
            log_level: level.into(),
            log_format: format.into(),
            ..Default::default()
        }
        .validate()
        .is_ok()
    }

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.observability.log_level = "invalid".into();
        match config.validate() {
            Err(ValidationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "observability.log_level");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = Config::default();
        config.funnel.retry.initial_backoff_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.funnel.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cron() {
        let mut config = Config::default();
        config.schedule.funnel_cron = "every evening".into();
        match config.validate() {
            Err(ValidationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "schedule.funnel_cron");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = Config::default();
        config.server.port = 0;
        config.execution.capital = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Multiple(errors)) if errors.len() == 2
        ));
    }
}
