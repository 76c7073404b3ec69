//! Run metrics. All functions are pure: they take a finished run and return
//! computed values, never NaN.

use crate::state::{Greeks, DAYS_PER_YEAR};
use crate::strategy::lifecycle::{PathPoint, RunOutcome};
use serde::Serialize;

/// Trading days per year for Sharpe annualization.
const TRADING_DAYS: f64 = 252.0;

/// Peak-to-trough stretch of a value series and where it recovered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DrawdownWindow {
    /// Index of the running peak the drawdown is measured from.
    pub start: usize,
    pub trough: usize,
    /// First index back at or above the peak, else the last index.
    pub end: usize,
    /// Fractional loss at the trough.
    pub depth: f64,
}

/// Aggregates for one strategy run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub annual_cost: f64,
    pub cost_percentage: f64,
    pub protection_ratio: f64,
    pub jump_risk_premium: f64,
    pub greeks: Greeks,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub worst_window: Option<DrawdownWindow>,
}

/// Deepest drawdown in `values`. None when the series never falls below a
/// prior peak.
pub fn worst_drawdown_window(values: &[f64]) -> Option<DrawdownWindow> {
    let mut peak_idx = 0;
    let mut worst: Option<DrawdownWindow> = None;

    for (i, &v) in values.iter().enumerate() {
        if v >= values[peak_idx] {
            peak_idx = i;
            continue;
        }
        let peak = values[peak_idx];
        if peak <= 0.0 {
            continue;
        }
        let depth = 1.0 - v / peak;
        if worst.map_or(true, |w| depth > w.depth) {
            worst = Some(DrawdownWindow { start: peak_idx, trough: i, end: i, depth });
        }
    }

    worst.map(|mut w| {
        let peak = values[w.start];
        w.end = values[w.trough..]
            .iter()
            .position(|&v| v >= peak)
            .map_or(values.len() - 1, |off| w.trough + off);
        w
    })
}

#[inline]
pub fn max_drawdown(values: &[f64]) -> f64 {
    worst_drawdown_window(values).map_or(0.0, |w| w.depth)
}

pub fn total_return(values: &[f64]) -> f64 {
    match (values.first(), values.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => last / first - 1.0,
        _ => 0.0,
    }
}

/// Annualized Sharpe of per-step returns (daily snapshots assumed).
pub fn sharpe_ratio(values: &[f64]) -> f64 {
    let returns: Vec<f64> = values
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let n = returns.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean = returns.iter().sum::<f64>() / nf;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (nf - 1.0);
    let std = var.sqrt();
    if std < 1e-12 {
        return 0.0;
    }
    (mean / std) * TRADING_DAYS.sqrt()
}

/// Net premium outflow over `days`, scaled to a year.
#[inline]
pub fn annualize(outflow: f64, days: f64) -> f64 {
    outflow * DAYS_PER_YEAR / days.max(1.0)
}

/// Peak hedge value inside the worst drawdown window of the protected
/// asset, counting proceeds already taken out since the window opened,
/// over total premium paid. Falls back to the whole path when the asset
/// never drew down.
pub fn scenario_protection_ratio(path: &[PathPoint], total_premium: f64) -> f64 {
    if total_premium <= 0.0 || path.is_empty() {
        return 0.0;
    }
    let protected: Vec<f64> = path.iter().map(|p| p.protected_value).collect();
    let (start, end) = match worst_drawdown_window(&protected) {
        Some(w) => (w.start, w.end),
        None => (0, path.len() - 1),
    };
    let base_proceeds = path[start].exit_proceeds;
    let peak = path[start..=end]
        .iter()
        .map(|p| p.hedge_value + (p.exit_proceeds - base_proceeds))
        .fold(0.0, f64::max);
    finite_or_zero(peak / total_premium)
}

fn mean_jump_risk_premium(outcome: &RunOutcome) -> f64 {
    let jrps: Vec<f64> = outcome.entries.iter().filter_map(|e| e.jump_risk_premium).collect();
    if jrps.is_empty() {
        return 0.0;
    }
    finite_or_zero(jrps.iter().sum::<f64>() / jrps.len() as f64)
}

fn entry_greeks(outcome: &RunOutcome) -> Greeks {
    outcome
        .entries
        .iter()
        .rev()
        .find_map(|e| e.greeks)
        .filter(Greeks::is_finite)
        .unwrap_or_default()
}

fn path_summary(outcome: &RunOutcome) -> (f64, f64, f64) {
    let totals: Vec<f64> = outcome.path.iter().map(|p| p.total_value).collect();
    (total_return(&totals), max_drawdown(&totals), sharpe_ratio(&totals))
}

/// Metrics for a run over a historical scenario spanning `span_days`.
pub fn scenario_metrics(outcome: &RunOutcome, span_days: f64) -> RunMetrics {
    let outflow = (outcome.total_premium_paid + outcome.total_fees - outcome.roll_salvage).max(0.0);
    let annual_cost = finite_or_zero(annualize(outflow, span_days));
    let (total_return, max_drawdown, sharpe) = path_summary(outcome);
    let protected: Vec<f64> = outcome.path.iter().map(|p| p.protected_value).collect();

    RunMetrics {
        annual_cost,
        cost_percentage: cost_percentage(annual_cost, outcome.initial_value),
        protection_ratio: scenario_protection_ratio(&outcome.path, outcome.total_premium_paid),
        jump_risk_premium: mean_jump_risk_premium(outcome),
        greeks: entry_greeks(outcome),
        total_return,
        max_drawdown,
        sharpe,
        worst_window: worst_drawdown_window(&protected),
    }
}

/// Metrics for a single-snapshot run. The premium is annualized over the
/// days the contract would be held before rolling; protection is the
/// stressed value per unit of premium.
pub fn point_in_time_metrics(outcome: &RunOutcome, rolling_threshold_days: u32) -> RunMetrics {
    let Some(entry) = outcome.entries.first() else {
        return RunMetrics {
            annual_cost: 0.0,
            cost_percentage: 0.0,
            protection_ratio: 0.0,
            jump_risk_premium: 0.0,
            greeks: Greeks::default(),
            total_return: 0.0,
            max_drawdown: 0.0,
            sharpe: 0.0,
            worst_window: None,
        };
    };
    let hold_days = (entry.days_to_expiration - i64::from(rolling_threshold_days)).max(1) as f64;
    let outflow = outcome.total_premium_paid + outcome.total_fees;
    let annual_cost = finite_or_zero(annualize(outflow, hold_days));
    let protection_ratio = match entry.stressed_price {
        Some(stressed) if entry.price > 0.0 => finite_or_zero(stressed / entry.price),
        _ => 0.0,
    };

    RunMetrics {
        annual_cost,
        cost_percentage: cost_percentage(annual_cost, outcome.initial_value),
        protection_ratio,
        jump_risk_premium: mean_jump_risk_premium(outcome),
        greeks: entry_greeks(outcome),
        total_return: 0.0,
        max_drawdown: 0.0,
        sharpe: 0.0,
        worst_window: None,
    }
}

#[inline]
fn cost_percentage(annual_cost: f64, portfolio_value: f64) -> f64 {
    if portfolio_value <= 0.0 {
        return 0.0;
    }
    finite_or_zero(annual_cost / portfolio_value)
}

#[inline]
fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}
