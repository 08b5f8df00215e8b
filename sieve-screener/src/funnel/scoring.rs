//! Two-pass composite scoring.
//!
//! Pass one collects raw metric values for the whole population and
//! records the min/max of each component. Pass two normalizes every
//! component to 0–100, combines them into a weighted composite and
//! ranks the population by composite.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Weight sums must land within this distance of 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Score given to every member when a component has no spread.
pub const DEGENERATE_SCORE: f64 = 50.0;

/// Min/max normalization to 0–100.
///
/// Returns exactly 50 when `max == min`, and 0 for non-finite input.
pub fn normalize(value: f64, min: f64, max: f64, inverse: bool) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    if max == min {
        return DEGENERATE_SCORE;
    }
    let score = ((value - min) / (max - min)).clamp(0.0, 1.0) * 100.0;
    if inverse {
        100.0 - score
    } else {
        score
    }
}

/// Percentile rank of each value, in input order.
///
/// Values are sorted descending with a stable sort, so ties keep
/// discovery order. The best value gets 100 and the worst 100/N.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let (va, vb) = (sanitize(values[a]), sanitize(values[b]));
        vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0; n];
    for (rank_index, &original) in order.iter().enumerate() {
        ranks[original] = (n - rank_index) as f64 / n as f64 * 100.0;
    }
    ranks
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        f64::MIN
    }
}

// ============================================================================
// Population Statistics
// ============================================================================

/// Min/max of each metric across one stage run's population.
///
/// Lives only for the duration of a run.
#[derive(Debug, Clone, Default)]
pub struct PopulationStats {
    ranges: HashMap<&'static str, (f64, f64)>,
    size: usize,
}

impl PopulationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one value. Non-finite values are ignored.
    pub fn observe(&mut self, metric: &'static str, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.ranges
            .entry(metric)
            .and_modify(|(min, max)| {
                *min = min.min(value);
                *max = max.max(value);
            })
            .or_insert((value, value));
    }

    /// Observed (min, max) for a metric.
    pub fn range(&self, metric: &str) -> Option<(f64, f64)> {
        self.ranges.get(metric).copied()
    }

    /// Number of population members.
    pub fn size(&self) -> usize {
        self.size
    }
}

// ============================================================================
// Components
// ============================================================================

/// How a raw metric maps onto 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Normalization {
    /// Population min/max, higher is better
    MinMax,
    /// Population min/max, lower is better
    Inverse,
    /// Fixed bounds, higher is better
    Absolute { lo: f64, hi: f64 },
    /// Fixed bounds, lower is better
    InverseAbsolute { lo: f64, hi: f64 },
    /// Percentile rank of the raw value within the population
    Percentile,
}

/// One weighted input to the composite.
pub struct ScoreComponent<M> {
    pub name: &'static str,
    pub weight: f64,
    pub extract: fn(&M) -> f64,
    pub normalization: Normalization,
}

impl<M> ScoreComponent<M> {
    pub fn new(
        name: &'static str,
        weight: f64,
        normalization: Normalization,
        extract: fn(&M) -> f64,
    ) -> Self {
        Self {
            name,
            weight,
            extract,
            normalization,
        }
    }
}

/// Check that weights are non-negative and sum to 1.0.
pub fn validate_weights<M>(components: &[ScoreComponent<M>]) -> Result<(), String> {
    if let Some(c) = components.iter().find(|c| c.weight < 0.0 || !c.weight.is_finite()) {
        return Err(format!("weight for {} must be a non-negative number", c.name));
    }
    let sum: f64 = components.iter().map(|c| c.weight).sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(format!("component weights sum to {sum:.6}, expected 1.0"));
    }
    Ok(())
}

/// Normalized value of one component for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub name: String,
    pub raw: f64,
    pub score: f64,
    pub weight: f64,
}

/// All scores for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub components: Vec<ComponentScore>,
    pub composite: f64,
    /// Rank of the composite within the run, 100 = best
    pub percentile_rank: f64,
}

impl ScoreCard {
    /// Normalized score of a named component.
    pub fn component(&self, name: &str) -> Option<f64> {
        self.components.iter().find(|c| c.name == name).map(|c| c.score)
    }
}

// ============================================================================
// Scorer
// ============================================================================

/// Score a population in two passes. Output is in input order.
pub fn score_population<M>(population: &[M], components: &[ScoreComponent<M>]) -> Vec<ScoreCard> {
    if population.is_empty() {
        return Vec::new();
    }

    // Pass one: raw values and ranges
    let mut stats = PopulationStats::new();
    stats.size = population.len();
    let raw: Vec<Vec<f64>> = components
        .iter()
        .map(|component| {
            population
                .iter()
                .map(|m| {
                    let value = (component.extract)(m);
                    stats.observe(component.name, value);
                    value
                })
                .collect()
        })
        .collect();

    let percentile_columns: Vec<Option<Vec<f64>>> = components
        .iter()
        .zip(&raw)
        .map(|(component, values)| {
            (component.normalization == Normalization::Percentile)
                .then(|| percentile_ranks(values))
        })
        .collect();

    // Pass two: normalize and combine
    let mut cards: Vec<ScoreCard> = (0..population.len())
        .map(|i| {
            let scored: Vec<ComponentScore> = components
                .iter()
                .enumerate()
                .map(|(c, component)| {
                    let value = raw[c][i];
                    let score = match component.normalization {
                        Normalization::Percentile => percentile_columns[c]
                            .as_ref()
                            .map_or(DEGENERATE_SCORE, |ranks| ranks[i]),
                        Normalization::Absolute { lo, hi } => normalize(value, lo, hi, false),
                        Normalization::InverseAbsolute { lo, hi } => normalize(value, lo, hi, true),
                        Normalization::MinMax | Normalization::Inverse => {
                            let inverse = component.normalization == Normalization::Inverse;
                            match stats.range(component.name) {
                                Some((min, max)) => normalize(value, min, max, inverse),
                                None => normalize(value, 0.0, 0.0, inverse),
                            }
                        }
                    };
                    ComponentScore {
                        name: component.name.to_string(),
                        raw: value,
                        score,
                        weight: component.weight,
                    }
                })
                .collect();

            let composite = scored.iter().map(|c| c.weight * c.score).sum();
            ScoreCard {
                components: scored,
                composite,
                percentile_rank: 0.0,
            }
        })
        .collect();

    let composites: Vec<f64> = cards.iter().map(|c| c.composite).collect();
    for (card, rank) in cards.iter_mut().zip(percentile_ranks(&composites)) {
        card.percentile_rank = rank;
    }

    cards
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct M {
        a: f64,
        b: f64,
    }

    fn components(wa: f64, wb: f64) -> Vec<ScoreComponent<M>> {
        vec![
            ScoreComponent::new("a", wa, Normalization::MinMax, |m: &M| m.a),
            ScoreComponent::new("b", wb, Normalization::Inverse, |m: &M| m.b),
        ]
    }

    #[test]
    fn test_normalize_bounds_and_inverse() {
        assert_eq!(normalize(5.0, 0.0, 10.0, false), 50.0);
        assert_eq!(normalize(15.0, 0.0, 10.0, false), 100.0);
        assert_eq!(normalize(-5.0, 0.0, 10.0, false), 0.0);
        assert_eq!(normalize(2.0, 0.0, 10.0, true), 80.0);
    }

    #[test]
    fn test_normalize_degenerate_range() {
        assert_eq!(normalize(7.0, 7.0, 7.0, false), 50.0);
        assert_eq!(normalize(7.0, 7.0, 7.0, true), 50.0);
    }

    #[test]
    fn test_normalize_non_finite() {
        assert_eq!(normalize(f64::NAN, 0.0, 1.0, false), 0.0);
        assert_eq!(normalize(f64::INFINITY, 0.0, 1.0, true), 0.0);
    }

    #[test]
    fn test_percentile_endpoints_and_ties() {
        let ranks = percentile_ranks(&[10.0, 30.0, 20.0, 30.0]);
        // 30 (index 1) first, tie at index 3 second, then 20, then 10
        assert_eq!(ranks, vec![25.0, 100.0, 50.0, 75.0]);
        assert!(percentile_ranks(&[]).is_empty());
        assert_eq!(percentile_ranks(&[1.0]), vec![100.0]);
    }

    #[test]
    fn test_validate_weights() {
        assert!(validate_weights(&components(0.6, 0.4)).is_ok());
        assert!(validate_weights(&components(0.6, 0.5)).is_err());
        assert!(validate_weights(&components(1.2, -0.2)).is_err());
        assert!(validate_weights(&components(0.3333333, 0.6666667)).is_ok());
    }

    #[test]
    fn test_score_population() {
        let population = vec![
            M { a: 0.0, b: 10.0 },
            M { a: 10.0, b: 0.0 },
            M { a: 5.0, b: 5.0 },
        ];
        let cards = score_population(&population, &components(0.5, 0.5));

        assert_eq!(cards[0].composite, 0.0);
        assert_eq!(cards[1].composite, 100.0);
        assert_eq!(cards[2].composite, 50.0);
        assert_eq!(cards[1].percentile_rank, 100.0);
        assert!((cards[2].percentile_rank - 200.0 / 3.0).abs() < 1e-9);
        assert!((cards[0].percentile_rank - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(cards[1].component("b"), Some(100.0));
    }

    #[test]
    fn test_single_member_population_scores_fifty() {
        let cards = score_population(&[M { a: 3.0, b: 4.0 }], &components(0.5, 0.5));
        assert_eq!(cards[0].composite, 50.0);
        assert_eq!(cards[0].percentile_rank, 100.0);
    }

    #[test]
    fn test_absolute_and_percentile_components() {
        let comps = vec![
            ScoreComponent::new("abs", 0.5, Normalization::Absolute { lo: 0.0, hi: 4.0 }, |m: &M| m.a),
            ScoreComponent::new("pct", 0.5, Normalization::Percentile, |m: &M| m.b),
        ];
        let population = vec![M { a: 1.0, b: 1.0 }, M { a: 8.0, b: 2.0 }];
        let cards = score_population(&population, &comps);
        assert_eq!(cards[0].component("abs"), Some(25.0));
        assert_eq!(cards[1].component("abs"), Some(100.0));
        assert_eq!(cards[0].component("pct"), Some(50.0));
        assert_eq!(cards[1].component("pct"), Some(100.0));
    }

    #[test]
    fn test_population_stats_ignores_non_finite() {
        let mut stats = PopulationStats::new();
        stats.observe("x", 3.0);
        stats.observe("x", f64::NAN);
        stats.observe("x", -1.0);
        assert_eq!(stats.range("x"), Some((-1.0, 3.0)));
        assert_eq!(stats.range("y"), None);
    }
}
