//! Sieve Screener - gated qualification funnel for listed equities.
//!
//! Narrows the exchange universe through nine phases down to sized,
//! approvable trade ideas, and tracks them once approved.

use anyhow::Result;
use sieve_common::config::Config;
use sieve_common::logging::init_logging_with_exclusions;
use sieve_screener::ScreenerService;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_and_validate()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Sieve Screener v{}", env!("CARGO_PKG_VERSION"));

    let service = ScreenerService::new(config)?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
