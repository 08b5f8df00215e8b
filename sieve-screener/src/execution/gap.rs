//! Pre-open gap classification for approved recommendations.

use serde::{Deserialize, Serialize};

use super::TradeLevels;

/// What to do with a card given the opening quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapAction {
    Enter,
    EnterAtOpen,
    Wait,
    Skip,
}

/// Chase and wait limits, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapRules {
    /// Skip when price is more than this far above the entry zone
    pub chase_limit_pct: f64,
    /// Wait instead of entering when the gap down is larger than this
    pub gap_wait_pct: f64,
}

impl Default for GapRules {
    fn default() -> Self {
        Self {
            chase_limit_pct: 2.0,
            gap_wait_pct: -2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapDecision {
    pub action: GapAction,
    pub price: f64,
    pub gap_pct: f64,
    pub reason: String,
}

/// Gap from the previous close, in percent. Zero without a usable close.
pub fn gap_pct(price: f64, prev_close: f64) -> f64 {
    if prev_close <= 0.0 {
        return 0.0;
    }
    (price - prev_close) / prev_close * 100.0
}

/// Classify an opening price. The first matching rule wins.
pub fn classify_gap(price: f64, prev_close: f64, levels: &TradeLevels, rules: &GapRules) -> GapDecision {
    let gap = gap_pct(price, prev_close);
    let chase_ceiling = levels.entry_high * (1.0 + rules.chase_limit_pct / 100.0);

    let (action, reason) = if price <= levels.stop {
        (GapAction::Skip, format!("price {price:.2} at or below stop {:.2}", levels.stop))
    } else if price > chase_ceiling {
        (
            GapAction::Skip,
            format!("price {price:.2} more than {}% above entry zone", rules.chase_limit_pct),
        )
    } else if price >= levels.entry_low && price <= levels.entry_high {
        (GapAction::Enter, "price inside entry zone".to_string())
    } else if price < levels.entry_low && gap < rules.gap_wait_pct {
        (GapAction::Wait, format!("gapped down {gap:.2}%, wait for stabilisation"))
    } else if price < levels.entry_low {
        (GapAction::EnterAtOpen, "below entry zone on a small gap".to_string())
    } else {
        (GapAction::Wait, "slightly above entry zone, wait for a pullback".to_string())
    };

    GapDecision {
        action,
        price,
        gap_pct: gap,
        reason,
    }
}
