//! Position tracking against recommendation levels.
//!
//! Status is derived from the stored levels and the price watermarks, so
//! applying the same snapshot twice leaves a position unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TradeLevels;

/// Position lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Approved, price has not reached the entry zone
    Pending,
    /// Entered, between stop and first target
    Active,
    #[serde(rename = "target_1_hit")]
    Target1Hit,
    #[serde(rename = "target_2_hit")]
    Target2Hit,
    StoppedOut,
    Closed,
}

impl PositionStatus {
    pub const ALL: [PositionStatus; 6] = [
        PositionStatus::Pending,
        PositionStatus::Active,
        PositionStatus::Target1Hit,
        PositionStatus::Target2Hit,
        PositionStatus::StoppedOut,
        PositionStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Target1Hit => "target_1_hit",
            PositionStatus::Target2Hit => "target_2_hit",
            PositionStatus::StoppedOut => "stopped_out",
            PositionStatus::Closed => "closed",
        }
    }

    /// Outcome is decided; watermarks no longer move the status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Target2Hit | PositionStatus::StoppedOut | PositionStatus::Closed
        )
    }

    /// Capital is at risk.
    pub fn is_live(&self) -> bool {
        matches!(self, PositionStatus::Active | PositionStatus::Target1Hit)
    }
}

/// A price observation for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub last: f64,
    pub high: f64,
    pub low: f64,
    pub at: DateTime<Utc>,
}

/// A tracked position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub recommendation_id: String,
    pub symbol: String,
    pub shares: u64,
    pub levels: TradeLevels,
    pub status: PositionStatus,
    /// Fill price, set on activation
    pub entry_price: Option<f64>,
    pub last_price: Option<f64>,
    pub high_watermark: Option<f64>,
    pub low_watermark: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl Position {
    pub fn new(
        recommendation_id: &str,
        symbol: &str,
        shares: u64,
        levels: TradeLevels,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recommendation_id: recommendation_id.to_string(),
            symbol: symbol.to_string(),
            shares,
            levels,
            status: PositionStatus::Pending,
            entry_price: None,
            last_price: None,
            high_watermark: None,
            low_watermark: None,
            opened_at: now,
            activated_at: None,
            updated_at: now,
            closed_at: None,
            exit_price: None,
            close_reason: None,
        }
    }

    /// Fold a snapshot into the position and recompute its status.
    pub fn apply_snapshot(&mut self, snapshot: &PriceSnapshot) -> PositionStatus {
        if self.status == PositionStatus::Closed {
            return self.status;
        }
        self.last_price = Some(snapshot.last);
        self.updated_at = snapshot.at;

        if self.activated_at.is_none() {
            let touched_zone =
                snapshot.low <= self.levels.entry_high && snapshot.high >= self.levels.entry_low;
            if !touched_zone {
                return self.status;
            }
            self.activated_at = Some(snapshot.at);
            self.entry_price = Some(snapshot.last.clamp(self.levels.entry_low, self.levels.entry_high));
            self.high_watermark = Some(snapshot.high);
            self.low_watermark = Some(snapshot.low);
        } else if !self.status.is_terminal() {
            self.high_watermark = Some(self.high_watermark.map_or(snapshot.high, |h| h.max(snapshot.high)));
            self.low_watermark = Some(self.low_watermark.map_or(snapshot.low, |l| l.min(snapshot.low)));
        }

        self.status = self.derive_status();
        self.status
    }

    /// Status implied by levels and watermarks.
    pub fn derive_status(&self) -> PositionStatus {
        if self.closed_at.is_some() {
            return PositionStatus::Closed;
        }
        let (Some(high), Some(low)) = (self.high_watermark, self.low_watermark) else {
            return PositionStatus::Pending;
        };
        if self.activated_at.is_none() {
            return PositionStatus::Pending;
        }

        let l = &self.levels;
        if high >= l.target_2 {
            PositionStatus::Target2Hit
        } else if low <= l.stop && high < l.target_1 {
            PositionStatus::StoppedOut
        } else if high >= l.target_1 {
            PositionStatus::Target1Hit
        } else {
            PositionStatus::Active
        }
    }

    pub fn close(&mut self, exit_price: Option<f64>, reason: &str, now: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.exit_price = exit_price;
        self.close_reason = Some(reason.to_string());
        self.closed_at = Some(now);
        self.updated_at = now;
    }

    /// Days since entry, or since approval when never entered.
    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.activated_at.unwrap_or(self.opened_at)).num_days()
    }

    fn reference_entry(&self) -> f64 {
        self.entry_price.unwrap_or(self.levels.entry_high)
    }

    pub fn risk_per_share(&self) -> f64 {
        (self.reference_entry() - self.levels.stop).max(0.0)
    }

    /// Money lost if the stop is hit from here.
    pub fn open_risk(&self) -> f64 {
        if !self.status.is_live() {
            return 0.0;
        }
        self.risk_per_share() * self.shares as f64
    }

    /// Result in multiples of initial risk, once the outcome is known.
    pub fn realized_r(&self) -> Option<f64> {
        let entry = self.entry_price?;
        let risk = self.risk_per_share();
        if risk <= 0.0 {
            return None;
        }
        let exit = match self.status {
            PositionStatus::Target2Hit => self.levels.target_2,
            PositionStatus::StoppedOut => self.levels.stop,
            PositionStatus::Closed => self.exit_price?,
            _ => return None,
        };
        Some((exit - entry) / risk)
    }

    pub fn unrealized_pnl(&self) -> Option<f64> {
        if !self.status.is_live() {
            return None;
        }
        Some((self.last_price? - self.entry_price?) * self.shares as f64)
    }
}

// ============================================================================
// Tests
// ============================================================================
