//! N-of-M qualification gate.
//!
//! A stage declares M named predicates; a record qualifies when at least
//! `required_minimum` of them pass.

use serde::{Deserialize, Serialize};

use super::scoring::ScoreCard;

/// A named pass/fail test over metrics, scores and thresholds.
pub struct Predicate<M, T> {
    pub name: &'static str,
    pub test: fn(&M, &ScoreCard, &T) -> bool,
}

impl<M, T> Predicate<M, T> {
    pub fn new(name: &'static str, test: fn(&M, &ScoreCard, &T) -> bool) -> Self {
        Self { name, test }
    }
}

/// `value >= threshold`, false for NaN.
pub fn at_least(value: f64, threshold: f64) -> bool {
    value >= threshold
}

/// `value <= threshold`, false for NaN.
pub fn at_most(value: f64, threshold: f64) -> bool {
    value <= threshold
}

/// `lo <= value <= hi`.
pub fn within(value: f64, lo: f64, hi: f64) -> bool {
    value >= lo && value <= hi
}

/// One predicate's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
}

/// Verdicts for all predicates of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub results: Vec<GateResult>,
    pub filters_passed: usize,
    pub required_minimum: usize,
    pub qualifies: bool,
}

/// Reject a minimum that no record could ever reach.
pub fn validate_required_minimum(required_minimum: usize, predicates: usize) -> Result<(), String> {
    if required_minimum > predicates {
        return Err(format!(
            "required minimum {required_minimum} exceeds the {predicates} available filters"
        ));
    }
    Ok(())
}

/// Run every predicate and count the passes.
pub fn evaluate<M, T>(
    predicates: &[Predicate<M, T>],
    metrics: &M,
    card: &ScoreCard,
    thresholds: &T,
    required_minimum: usize,
) -> GateOutcome {
    let results: Vec<GateResult> = predicates
        .iter()
        .map(|p| GateResult {
            name: p.name.to_string(),
            passed: (p.test)(metrics, card, thresholds),
        })
        .collect();
    let filters_passed = results.iter().filter(|r| r.passed).count();

    GateOutcome {
        results,
        filters_passed,
        required_minimum,
        qualifies: filters_passed >= required_minimum,
    }
}
