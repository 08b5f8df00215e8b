//! Circuit breaker guarding the market data provider.
//!
//! The batched fetcher reports every provider call here. A run of
//! consecutive transient failures (network, rate limit, unavailable)
//! opens the circuit, which the fetcher turns into a whole-batch error.
//! Per-symbol data failures are not reported and never trip it.
//!
//! # States
//!
//! ```text
//! ┌─────────┐     failure_threshold    ┌────────┐
//! │ CLOSED  │ ─────────────────────────│  OPEN  │
//! │(normal) │      exceeded            │(blocked)│
//! └─────────┘                          └────────┘
//!      ▲                                   │
//!      │     success                       │ reset_timeout
//!      │                                   ▼
//!      │                            ┌───────────┐
//!      └────────────────────────────│ HALF_OPEN │
//!                                   │(probing)  │
//!                                   └───────────┘
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Current state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,
    /// Circuit tripped, calls blocked
    Open,
    /// Probing whether the provider recovered
    HalfOpen,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to keep circuit open before probing
    pub reset_timeout: Duration,
    /// Successful probes needed to close the circuit from half-open
    pub success_threshold: u32,
    /// Name for logging purposes
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(2),
            success_threshold: 1,
            name: "provider".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a custom name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the success threshold
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

// ============================================================================
// Circuit Breaker Implementation
// ============================================================================

/// Circuit breaker for provider calls.
///
/// Thread-safe; state lives in atomics so it can be shared across phases.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Consecutive failure count
    failure_count: AtomicU32,
    /// Consecutive success count (half-open only)
    success_count: AtomicU32,
    /// Unix millis when the circuit opened, 0 when closed
    opened_at: AtomicU64,
    /// `CircuitState` as u32
    state: AtomicU32,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            state: AtomicU32::new(CircuitState::Closed as u32),
        }
    }

    /// Create a circuit breaker with default configuration and a name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.state_with_timeout_check()
    }

    /// Check if a call can be made
    pub fn can_execute(&self) -> bool {
        self.state_with_timeout_check() != CircuitState::Open
    }

    /// Record a successful call
    pub fn record_success(&self) {
        match self.state_with_timeout_check() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.close_circuit();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a transient failure.
    ///
    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let tripped = match self.state_with_timeout_check() {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.open_circuit();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens the circuit
                self.open_circuit();
                true
            }
            CircuitState::Open => false,
        };

        tracing::trace!(
            circuit = %self.config.name,
            failure_count = self.failure_count.load(Ordering::Relaxed),
            tripped,
            "Circuit breaker recorded failure"
        );

        tripped
    }

    /// Consecutive failures seen so far
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Get statistics about the circuit breaker
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: self.state_with_timeout_check(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            failure_threshold: self.config.failure_threshold,
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        self.close_circuit();
    }

    // ========================================================================
    // Private Methods
    // ========================================================================

    fn state_with_timeout_check(&self) -> CircuitState {
        let state = match self.state.load(Ordering::Acquire) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        };

        if state == CircuitState::Open {
            let opened_at = self.opened_at.load(Ordering::Relaxed);
            let elapsed_ms = now_millis().saturating_sub(opened_at);
            if elapsed_ms >= self.config.reset_timeout.as_millis() as u64 {
                self.transition_to_half_open();
                return CircuitState::HalfOpen;
            }
        }

        state
    }

    fn open_circuit(&self) {
        self.state.store(CircuitState::Open as u32, Ordering::Release);
        self.success_count.store(0, Ordering::Relaxed);
        self.opened_at.store(now_millis(), Ordering::Relaxed);

        tracing::warn!(
            circuit = %self.config.name,
            failure_count = self.failure_count.load(Ordering::Relaxed),
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker OPENED"
        );
    }

    fn transition_to_half_open(&self) {
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u32,
                CircuitState::HalfOpen as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.success_count.store(0, Ordering::Relaxed);
            tracing::info!(circuit = %self.config.name, "Circuit breaker HALF_OPEN");
        }
    }

    fn close_circuit(&self) {
        let was = self.state.swap(CircuitState::Closed as u32, Ordering::AcqRel);
        self.failure_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.opened_at.store(0, Ordering::Relaxed);

        if was != CircuitState::Closed as u32 {
            tracing::info!(circuit = %self.config.name, "Circuit breaker CLOSED");
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of a circuit breaker for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
}

// ============================================================================
// Tests
// ============================================================================
