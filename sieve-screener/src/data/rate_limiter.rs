//! Fixed-interval pacer for provider calls.
//!
//! Every phase configures a delay between consecutive provider calls.
//! `acquire` returns once at least that delay has passed since the
//! previous caller was released.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// A fixed-interval rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between releases
    interval: Duration,
    /// Earliest instant the next caller may proceed
    next_slot: Mutex<Option<Instant>>,
    /// Name for logging
    name: String,
}

impl RateLimiter {
    /// Create a new pacer with the given spacing.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Create a pacer from a millisecond delay.
    pub fn from_millis(name: impl Into<String>, delay_ms: u64) -> Self {
        Self::new(name, Duration::from_millis(delay_ms))
    }

    /// Wait for the next slot.
    ///
    /// The lock is held across the sleep, so concurrent callers are
    /// released one interval apart in arrival order.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();

        if let Some(slot) = *next_slot {
            if slot > now {
                let wait = slot - now;
                trace!(
                    limiter = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Pacing provider call"
                );
                tokio::time::sleep(wait).await;
            }
        }

        *next_slot = Some(Instant::now() + self.interval);
    }

    /// Configured spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ============================================================================
// Tests
// ============================================================================
