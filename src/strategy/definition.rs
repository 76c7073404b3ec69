use crate::errors::{HedgeError, HedgeResult};
use crate::models::ModelKind;
use crate::state::ChainEntry;
use crate::strategy::triggers::{self, ExitTrigger, TriggerMetric};
use serde::{Deserialize, Serialize};

/// Minimum liquidity a chain entry must show to be selectable.
/// Entries with no bid, or with neither volume nor open interest, are
/// always excluded on top of these floors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityFloor {
    /// Bid must be strictly above this.
    pub min_bid: f64,
    pub min_volume: u64,
    pub min_open_interest: u64,
}

impl LiquidityFloor {
    #[inline]
    pub fn passes(&self, entry: &ChainEntry) -> bool {
        entry.is_tradeable()
            && entry.bid > self.min_bid
            && entry.ask >= entry.bid
            && entry.volume >= self.min_volume
            && entry.open_interest >= self.min_open_interest
    }
}

fn default_rolling_threshold() -> u32 {
    21
}

fn default_roll_grace() -> u32 {
    5
}

fn default_hard_floor() -> u32 {
    5
}

/// Immutable description of one hedging program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgingStrategyDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Strike target is spot * (1 - target_otm_pct).
    pub target_otm_pct: f64,
    pub min_dte: u32,
    pub max_dte: u32,
    #[serde(default = "default_rolling_threshold")]
    pub rolling_threshold_days: u32,
    /// Share of portfolio value spent per entry before regime scaling.
    pub allocation_fraction: f64,
    pub max_allocation: f64,
    #[serde(default)]
    pub exit_triggers: Vec<ExitTrigger>,
    #[serde(default)]
    pub pricing_model: ModelKind,
    #[serde(default)]
    pub liquidity: LiquidityFloor,
    /// Days a roll may be deferred while the term structure is inverted.
    #[serde(default = "default_roll_grace")]
    pub roll_grace_days: u32,
    /// At or below this DTE the roll happens regardless of regime.
    #[serde(default = "default_hard_floor")]
    pub hard_roll_floor_days: u32,
    /// Replaces the regime analyzer's allocation multipliers (low..crisis).
    #[serde(default)]
    pub regime_allocation_overrides: Option<[f64; 4]>,
}

impl HedgingStrategyDefinition {
    pub fn new(id: impl Into<String>, target_otm_pct: f64, min_dte: u32, max_dte: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            target_otm_pct,
            min_dte,
            max_dte,
            rolling_threshold_days: default_rolling_threshold(),
            allocation_fraction: 0.02,
            max_allocation: 0.05,
            exit_triggers: Vec::new(),
            pricing_model: ModelKind::default(),
            liquidity: LiquidityFloor::default(),
            roll_grace_days: default_roll_grace(),
            hard_roll_floor_days: default_hard_floor(),
            regime_allocation_overrides: None,
        }
    }

    pub fn with_allocation(mut self, allocation_fraction: f64, max_allocation: f64) -> Self {
        self.allocation_fraction = allocation_fraction;
        self.max_allocation = max_allocation;
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<ExitTrigger>) -> Self {
        self.exit_triggers = triggers;
        self
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.pricing_model = model;
        self
    }

    pub fn with_rolling_threshold(mut self, days: u32) -> Self {
        self.rolling_threshold_days = days;
        self
    }

    pub fn with_roll_policy(mut self, grace_days: u32, hard_floor_days: u32) -> Self {
        self.roll_grace_days = grace_days;
        self.hard_roll_floor_days = hard_floor_days;
        self
    }

    pub fn with_liquidity(mut self, floor: LiquidityFloor) -> Self {
        self.liquidity = floor;
        self
    }

    pub fn with_regime_allocation(mut self, multipliers: [f64; 4]) -> Self {
        self.regime_allocation_overrides = Some(multipliers);
        self
    }

    /// 2-month 15% OTM puts with an aggressive exit ladder.
    pub fn two_month_15pct_otm() -> Self {
        Self::new("spx-2m-15otm", 0.15, 45, 75)
            .with_triggers(vec![
                ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 0.25),
                ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 3.0, 0.40),
                ExitTrigger::at_least(TriggerMetric::PortfolioDrawdown, 0.08, 0.50),
            ])
            .with_regime_allocation([1.0, 1.3, 1.8, 2.5])
    }

    /// 6-month 15% OTM puts with a conservative exit ladder.
    pub fn six_month_15pct_otm() -> Self {
        Self::new("spx-6m-15otm", 0.15, 165, 195)
            .with_triggers(vec![
                ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 5.0, 0.30),
                ExitTrigger::at_least(TriggerMetric::Vix, 45.0, 0.25),
            ])
            .with_regime_allocation([1.0, 1.2, 1.4, 1.8])
    }

    /// 3-month 10% OTM puts on the full profit-taking ladder plus
    /// drawdown monetization.
    pub fn three_month_10pct_otm_laddered() -> Self {
        let mut ladder = triggers::default_ladder();
        ladder.extend(triggers::drawdown_ladder());
        Self::new("spx-3m-10otm-ladder", 0.10, 80, 100).with_triggers(ladder)
    }

    /// Rejected definitions abort a comparison before any simulation runs.
    pub fn validate(&self) -> HedgeResult<()> {
        let fail = |msg: String| Err(HedgeError::Config(format!("strategy '{}': {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(HedgeError::Config("strategy id must not be empty".into()));
        }
        if !(self.target_otm_pct >= 0.0 && self.target_otm_pct < 1.0) {
            return fail(format!("target_otm_pct must be in [0, 1), got {}", self.target_otm_pct));
        }
        if self.min_dte == 0 {
            return fail("min_dte must be > 0".into());
        }
        if self.min_dte > self.max_dte {
            return fail(format!("min_dte {} > max_dte {}", self.min_dte, self.max_dte));
        }
        if self.rolling_threshold_days >= self.min_dte {
            return fail(format!(
                "rolling_threshold_days {} must be below min_dte {}",
                self.rolling_threshold_days, self.min_dte
            ));
        }
        if self.hard_roll_floor_days > self.rolling_threshold_days {
            return fail(format!(
                "hard_roll_floor_days {} must not exceed rolling_threshold_days {}",
                self.hard_roll_floor_days, self.rolling_threshold_days
            ));
        }
        if !(self.max_allocation > 0.0 && self.max_allocation <= 1.0) {
            return fail(format!("max_allocation must be in (0, 1], got {}", self.max_allocation));
        }
        if !(self.allocation_fraction > 0.0 && self.allocation_fraction <= 1.0) {
            return fail(format!(
                "allocation_fraction must be in (0, 1], got {}",
                self.allocation_fraction
            ));
        }
        if !self.liquidity.min_bid.is_finite() || self.liquidity.min_bid < 0.0 {
            return fail("liquidity min_bid must be >= 0".into());
        }
        if let Some(mults) = &self.regime_allocation_overrides {
            if mults.iter().any(|m| !m.is_finite() || *m <= 0.0) {
                return fail("regime allocation multipliers must be > 0".into());
            }
        }
        for trigger in &self.exit_triggers {
            trigger.validate().map_err(|e| {
                HedgeError::Config(format!("strategy '{}': {e}", self.id))
            })?;
        }
        Ok(())
    }

    /// Mid-point of the DTE window, used for point-in-time annualization.
    #[inline]
    pub fn target_dte(&self) -> u32 {
        (self.min_dte + self.max_dte) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::state::OptionType;

    #[test]
    fn test_presets_valid() {
        assert!(HedgingStrategyDefinition::two_month_15pct_otm().validate().is_ok());
        assert!(HedgingStrategyDefinition::six_month_15pct_otm().validate().is_ok());

        let laddered = HedgingStrategyDefinition::three_month_10pct_otm_laddered();
        assert!(laddered.validate().is_ok());
        assert_eq!(laddered.exit_triggers.len(), 10);
    }

    #[test]
    fn test_rejects_bad_config() {
        let base = HedgingStrategyDefinition::new("s", 0.15, 45, 75);
        assert!(base.validate().is_ok());

        let bad = base.clone().with_allocation(0.02, 1.5);
        assert!(matches!(bad.validate(), Err(HedgeError::Config(_))), "max_allocation > 1");

        let bad = HedgingStrategyDefinition::new("s", 0.15, 90, 60);
        assert!(bad.validate().is_err(), "min_dte > max_dte");

        let bad = base.clone().with_rolling_threshold(50);
        assert!(bad.validate().is_err(), "threshold above min_dte would roll immediately");

        let bad = base.clone().with_roll_policy(5, 30);
        assert!(bad.validate().is_err());

        let bad = HedgingStrategyDefinition::new("", 0.15, 45, 75);
        assert!(bad.validate().is_err());

        let bad = base.with_triggers(vec![ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 2.0)]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_liquidity_floor() {
        let entry = ChainEntry {
            strike: 3800.0,
            expiration: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            option_type: OptionType::Put,
            bid: 1.0,
            ask: 1.2,
            last: 1.1,
            volume: 5,
            open_interest: 0,
        };
        assert!(LiquidityFloor::default().passes(&entry));
        let floor = LiquidityFloor { min_bid: 0.0, min_volume: 0, min_open_interest: 100 };
        assert!(!floor.passes(&entry));
        let dead = ChainEntry { bid: 0.0, volume: 0, open_interest: 0, ..entry };
        assert!(!LiquidityFloor::default().passes(&dead));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "id": "custom",
            "target_otm_pct": 0.1,
            "min_dte": 30,
            "max_dte": 60,
            "allocation_fraction": 0.01,
            "max_allocation": 0.03,
            "exit_triggers": [
                {"metric": "unrealized_multiple", "comparator": ">=", "threshold": 5.0, "action_fraction": 0.5}
            ]
        }"#;
        let s: HedgingStrategyDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(s.rolling_threshold_days, 21);
        assert_eq!(s.hard_roll_floor_days, 5);
        assert_eq!(s.pricing_model, ModelKind::JumpDiffusion);
        assert!(s.validate().is_ok());
    }
}
