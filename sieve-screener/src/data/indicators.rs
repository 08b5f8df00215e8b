//! Technical indicators over daily candles.
//!
//! All functions expect candles in chronological order and return `None`
//! when there is not enough history.

use std::collections::BTreeMap;

use chrono::Datelike;
use statrs::statistics::Statistics;

use super::Candle;

/// Closing prices.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().mean())
}

/// Percentage return over the last `bars` bars.
pub fn pct_return(values: &[f64], bars: usize) -> Option<f64> {
    if bars == 0 || values.len() <= bars {
        return None;
    }
    let from = values[values.len() - 1 - bars];
    let to = *values.last()?;
    if from == 0.0 {
        return None;
    }
    Some((to - from) / from * 100.0)
}

/// Average true range over the last `period` bars.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() <= period {
        return None;
    }
    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();
    Some(true_ranges[true_ranges.len() - period..].iter().mean())
}

/// Wilder's relative strength index.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() <= period {
        return None;
    }

    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;

    for change in &changes[period..] {
        avg_gain = (avg_gain * (period as f64 - 1.0) + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + (-change).max(0.0)) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Sample standard deviation.
pub fn stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    Some(values.iter().std_dev())
}

/// Coefficient of variation (stdev / mean).
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let mean = values.iter().mean();
    if !mean.is_finite() || mean == 0.0 {
        return None;
    }
    Some(stdev(values)? / mean)
}

/// Largest peak-to-trough decline, as a positive percentage.
pub fn max_drawdown_pct(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak * 100.0);
        }
    }
    worst
}

/// R² of a least-squares line through the log of the values.
pub fn log_trend_r2(values: &[f64]) -> Option<f64> {
    if values.len() < 3 || values.iter().any(|v| *v <= 0.0) {
        return None;
    }
    let ys: Vec<f64> = values.iter().map(|v| v.ln()).collect();
    let n = ys.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().mean();

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if syy == 0.0 {
        // Perfectly flat series
        return Some(0.0);
    }
    Some((sxy * sxy) / (sxx * syy))
}

/// Mean daily turnover (close × volume) over the last `bars` bars.
pub fn avg_turnover(candles: &[Candle], bars: usize) -> Option<f64> {
    if bars == 0 || candles.is_empty() {
        return None;
    }
    let start = candles.len().saturating_sub(bars);
    Some(candles[start..].iter().map(Candle::turnover).mean())
}

/// Mean volume over a slice of bars.
pub fn avg_volume(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    Some(candles.iter().map(|c| c.volume).mean())
}

/// Highest high over the last `bars` bars.
pub fn highest_high(candles: &[Candle], bars: usize) -> Option<f64> {
    let start = candles.len().checked_sub(bars.min(candles.len()))?;
    candles[start..].iter().map(|c| c.high).reduce(f64::max)
}

/// Lowest low over the last `bars` bars.
pub fn lowest_low(candles: &[Candle], bars: usize) -> Option<f64> {
    let start = candles.len().checked_sub(bars.min(candles.len()))?;
    candles[start..].iter().map(|c| c.low).reduce(f64::min)
}

/// Week-over-week returns (%) from the last close of each ISO week.
pub fn weekly_returns(candles: &[Candle]) -> Vec<f64> {
    let mut week_closes: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for c in candles {
        let week = c.date.iso_week();
        week_closes.insert((week.year(), week.week()), c.close);
    }
    let closes: Vec<f64> = week_closes.into_values().collect();
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
