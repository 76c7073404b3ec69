use crate::errors::{HedgeError, HedgeResult};
use crate::portfolio::Position;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Quantity an exit trigger watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMetric {
    /// Current price / entry price.
    UnrealizedMultiple,
    /// VIX level on the current snapshot.
    Vix,
    /// Total portfolio drawdown from its running peak, as a fraction.
    PortfolioDrawdown,
    DaysHeld,
    DaysToExpiration,
}

impl std::fmt::Display for TriggerMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnrealizedMultiple => write!(f, "unrealized_multiple"),
            Self::Vix => write!(f, "vix"),
            Self::PortfolioDrawdown => write!(f, "portfolio_drawdown"),
            Self::DaysHeld => write!(f, "days_held"),
            Self::DaysToExpiration => write!(f, "days_to_expiration"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "<=")]
    AtMost,
}

impl Comparator {
    #[inline]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::AtLeast => value >= threshold,
            Comparator::AtMost => value <= threshold,
        }
    }
}

/// (metric, comparator, threshold, action fraction), e.g.
/// "unrealized multiple >= 5 liquidates 50%".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitTrigger {
    pub metric: TriggerMetric,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Share of the remaining quantity to sell when the trigger fires.
    pub action_fraction: f64,
}

impl ExitTrigger {
    pub fn new(metric: TriggerMetric, comparator: Comparator, threshold: f64, action_fraction: f64) -> Self {
        Self {
            metric,
            comparator,
            threshold,
            action_fraction,
        }
    }

    pub fn at_least(metric: TriggerMetric, threshold: f64, action_fraction: f64) -> Self {
        Self::new(metric, Comparator::AtLeast, threshold, action_fraction)
    }

    pub fn at_most(metric: TriggerMetric, threshold: f64, action_fraction: f64) -> Self {
        Self::new(metric, Comparator::AtMost, threshold, action_fraction)
    }

    pub fn validate(&self) -> HedgeResult<()> {
        if !self.threshold.is_finite() {
            return Err(HedgeError::Config(format!("{} trigger threshold must be finite", self.metric)));
        }
        if !(self.action_fraction > 0.0 && self.action_fraction <= 1.0) {
            return Err(HedgeError::Config(format!(
                "{} trigger action fraction must be in (0, 1], got {}",
                self.metric, self.action_fraction
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_full_exit(&self) -> bool {
        self.action_fraction >= 1.0
    }

    #[inline]
    pub fn holds(&self, inputs: &TriggerInputs) -> bool {
        self.comparator.holds(inputs.value(self.metric), self.threshold)
    }
}

/// Observed values for one position at one snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerInputs {
    pub unrealized_multiple: f64,
    pub vix: f64,
    pub portfolio_drawdown: f64,
    pub days_held: i64,
    pub days_to_expiration: i64,
}

impl TriggerInputs {
    #[inline]
    pub fn value(&self, metric: TriggerMetric) -> f64 {
        match metric {
            TriggerMetric::UnrealizedMultiple => self.unrealized_multiple,
            TriggerMetric::Vix => self.vix,
            TriggerMetric::PortfolioDrawdown => self.portfolio_drawdown,
            TriggerMetric::DaysHeld => self.days_held as f64,
            TriggerMetric::DaysToExpiration => self.days_to_expiration as f64,
        }
    }
}

/// A trigger that held this evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiredTrigger {
    pub index: usize,
    pub trigger: ExitTrigger,
}

/// Unfired triggers whose condition holds, in definition order.
/// Triggers already recorded on the position are never re-evaluated.
pub fn evaluate(
    triggers: &[ExitTrigger],
    position: &Position,
    inputs: &TriggerInputs,
) -> SmallVec<[FiredTrigger; 4]> {
    triggers
        .iter()
        .enumerate()
        .filter(|(i, _)| !position.has_fired(*i))
        .filter(|(_, t)| t.holds(inputs))
        .map(|(index, trigger)| FiredTrigger { index, trigger: *trigger })
        .collect()
}

/// Profit-taking and VIX-spike ladder.
pub fn default_ladder() -> Vec<ExitTrigger> {
    vec![
        ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 2.0, 0.25),
        ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 5.0, 0.40),
        ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 10.0, 0.60),
        ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 20.0, 0.80),
        ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 0.25),
        ExitTrigger::at_least(TriggerMetric::Vix, 45.0, 0.50),
        ExitTrigger::at_least(TriggerMetric::Vix, 60.0, 0.75),
    ]
}

/// Monetize into a portfolio drawdown: 30/60/90% out at 5/10/15%.
pub fn drawdown_ladder() -> Vec<ExitTrigger> {
    vec![
        ExitTrigger::at_least(TriggerMetric::PortfolioDrawdown, 0.05, 0.30),
        ExitTrigger::at_least(TriggerMetric::PortfolioDrawdown, 0.10, 0.60),
        ExitTrigger::at_least(TriggerMetric::PortfolioDrawdown, 0.15, 0.90),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::PositionId;
    use crate::state::{OptionContract, OptionType};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn position() -> Position {
        let contract = OptionContract::new(
            "SPX",
            3800.0,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionType::Put,
            None,
        )
        .unwrap();
        Position::new(
            PositionId(1),
            contract,
            1.0,
            1.0,
            100.0,
            Utc.with_ymd_and_hms(2024, 1, 2, 16, 0, 0).unwrap(),
        )
    }

    fn inputs(multiple: f64) -> TriggerInputs {
        TriggerInputs {
            unrealized_multiple: multiple,
            vix: 18.0,
            portfolio_drawdown: 0.0,
            days_held: 3,
            days_to_expiration: 40,
        }
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::AtLeast.holds(5.0, 5.0));
        assert!(!Comparator::AtLeast.holds(4.99, 5.0));
        assert!(Comparator::AtMost.holds(10.0, 10.0));
        assert!(!Comparator::AtMost.holds(11.0, 10.0));
    }

    #[test]
    fn test_fired_triggers_skipped() {
        let triggers = vec![ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 5.0, 0.5)];
        let mut pos = position();
        let fired = evaluate(&triggers, &pos, &inputs(6.0));
        assert_eq!(fired.len(), 1);
        pos.mark_fired(fired[0].index);
        assert!(evaluate(&triggers, &pos, &inputs(7.0)).is_empty(), "must not fire twice");
    }

    #[test]
    fn test_metric_selection() {
        let pos = position();
        let triggers = vec![
            ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 0.25),
            ExitTrigger::at_most(TriggerMetric::DaysToExpiration, 40.0, 1.0),
            ExitTrigger::at_least(TriggerMetric::DaysHeld, 10.0, 1.0),
        ];
        let fired = evaluate(&triggers, &pos, &inputs(1.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].index, 1);
        assert!(fired[0].trigger.is_full_exit());
    }

    #[test]
    fn test_validation() {
        assert!(ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 0.0).validate().is_err());
        assert!(ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 1.5).validate().is_err());
        assert!(ExitTrigger::at_least(TriggerMetric::Vix, f64::NAN, 0.5).validate().is_err());
        assert!(default_ladder().iter().all(|t| t.validate().is_ok()));
        assert!(drawdown_ladder().iter().all(|t| t.validate().is_ok()));
    }

    #[test]
    fn test_serde_shape() {
        let t: ExitTrigger = serde_json::from_str(
            r#"{"metric":"unrealized_multiple","comparator":">=","threshold":5.0,"action_fraction":0.5}"#,
        )
        .unwrap();
        assert_eq!(t, ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 5.0, 0.5));
    }
}
