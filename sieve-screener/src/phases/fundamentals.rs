//! Phase 6: fundamentals.
//!
//! Year-over-year growth compares the latest quarter with the same
//! quarter a year earlier, so five reported quarters are the minimum.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::{FundamentalsConfig, FundamentalsThresholds};
use crate::data::{FundamentalSnapshot, MarketDataProvider, ProviderError};
use crate::funnel::gate::{at_least, at_most};
use crate::funnel::{Normalization, Phase, Predicate, ScoreCard, ScoreComponent, StageSpec};

/// Quarters between a result and its year-ago comparison.
const YEAR_AGO: usize = 4;
/// Growth is clamped to this band (%).
const GROWTH_FLOOR: f64 = -100.0;
const GROWTH_CAP: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsMetrics {
    pub revenue_growth_yoy: f64,
    pub profit_growth_yoy: f64,
    pub operating_margin: f64,
    /// Change in operating margin against a year ago, percentage points
    pub margin_trend: f64,
    pub promoter_pct: f64,
    pub pledged_pct: f64,
    /// Change in institutional holding over the last quarter, percentage points
    pub institutional_change: f64,
}

/// Growth of `current` over `previous` (%), clamped.
///
/// A non-positive base counts as full growth when the current figure
/// improved on it, and as a full decline otherwise.
pub(crate) fn yoy_growth(current: f64, previous: f64) -> f64 {
    if previous <= 0.0 {
        return if current > previous {
            GROWTH_CAP
        } else if current == previous {
            0.0
        } else {
            GROWTH_FLOOR
        };
    }
    ((current - previous) / previous * 100.0).clamp(GROWTH_FLOOR, GROWTH_CAP)
}

pub struct FundamentalsStage {
    provider: Arc<dyn MarketDataProvider>,
    config: FundamentalsConfig,
}

impl FundamentalsStage {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: FundamentalsConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl StageSpec for FundamentalsStage {
    type Payload = FundamentalSnapshot;
    type Metrics = FundamentalsMetrics;
    type Thresholds = FundamentalsThresholds;
    type Context = ();

    fn phase(&self) -> Phase {
        Phase::Fundamentals
    }

    fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.config.fetch_delay_ms)
    }

    fn required_minimum(&self) -> usize {
        self.config.required_minimum
    }

    async fn prepare(&self, _candidates: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_one(&self, symbol: &str, _ctx: &()) -> Result<FundamentalSnapshot, ProviderError> {
        self.provider.get_fundamentals(symbol, self.config.quarters).await
    }

    fn measure(&self, _symbol: &str, snapshot: &FundamentalSnapshot, _ctx: &()) -> Option<FundamentalsMetrics> {
        let latest = snapshot.quarters.first()?;
        let year_ago = snapshot.quarters.get(YEAR_AGO)?;
        let holding = &snapshot.shareholding;

        Some(FundamentalsMetrics {
            revenue_growth_yoy: yoy_growth(latest.revenue, year_ago.revenue),
            profit_growth_yoy: yoy_growth(latest.net_profit, year_ago.net_profit),
            operating_margin: latest.operating_margin(),
            margin_trend: latest.operating_margin() - year_ago.operating_margin(),
            promoter_pct: holding.promoter_pct,
            pledged_pct: holding.pledged_pct,
            institutional_change: holding
                .prev_institutional_pct
                .map_or(0.0, |prev| holding.institutional_pct - prev),
        })
    }

    fn components(&self) -> Vec<ScoreComponent<FundamentalsMetrics>> {
        let w = &self.config.weights;
        vec![
            ScoreComponent::new(
                "revenue_growth",
                w.revenue_growth,
                Normalization::MinMax,
                |m: &FundamentalsMetrics| m.revenue_growth_yoy,
            ),
            ScoreComponent::new(
                "profit_growth",
                w.profit_growth,
                Normalization::MinMax,
                |m: &FundamentalsMetrics| m.profit_growth_yoy,
            ),
            ScoreComponent::new(
                "operating_margin",
                w.operating_margin,
                Normalization::Percentile,
                |m: &FundamentalsMetrics| m.operating_margin,
            ),
            ScoreComponent::new(
                "margin_trend",
                w.margin_trend,
                Normalization::MinMax,
                |m: &FundamentalsMetrics| m.margin_trend,
            ),
            ScoreComponent::new(
                "promoter",
                w.promoter,
                Normalization::Absolute { lo: 0.0, hi: 75.0 },
                |m: &FundamentalsMetrics| m.promoter_pct,
            ),
            ScoreComponent::new(
                "pledge",
                w.pledge,
                Normalization::InverseAbsolute { lo: 0.0, hi: 50.0 },
                |m: &FundamentalsMetrics| m.pledged_pct,
            ),
            ScoreComponent::new(
                "institutional",
                w.institutional,
                Normalization::Absolute { lo: -5.0, hi: 5.0 },
                |m: &FundamentalsMetrics| m.institutional_change,
            ),
        ]
    }

    fn thresholds(&self, _ctx: &()) -> FundamentalsThresholds {
        self.config.thresholds.clone()
    }

    fn predicates(&self) -> Vec<Predicate<FundamentalsMetrics, FundamentalsThresholds>> {
        type M = FundamentalsMetrics;
        type T = FundamentalsThresholds;
        vec![
            Predicate::new("revenue_growth", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.revenue_growth_yoy, t.min_revenue_growth)
            }),
            Predicate::new("profit_growth", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.profit_growth_yoy, t.min_profit_growth)
            }),
            Predicate::new("operating_margin", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.operating_margin, t.min_operating_margin)
            }),
            Predicate::new("margin_not_falling", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.margin_trend, -t.max_margin_decline)
            }),
            Predicate::new("promoter_holding", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.promoter_pct, t.min_promoter_pct)
            }),
            Predicate::new("low_pledge", |m: &M, _: &ScoreCard, t: &T| {
                at_most(m.pledged_pct, t.max_pledged_pct)
            }),
            Predicate::new("institutions_holding", |m: &M, _: &ScoreCard, t: &T| {
                at_least(m.institutional_change, -t.max_institutional_exit)
            }),
        ]
    }
}
