use crate::analysis::ranking::CompositeScore;
use crate::analysis::scenarios::{StressProfile, StressShock};
use crate::errors::{HedgeError, HedgeResult};
use crate::models::regime::RegimeConfig;
use crate::models::JumpParams;
use crate::strategy::selection::SynthesisSettings;
use std::path::PathBuf;

/// Per-run engine parameters shared read-only by every strategy run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub initial_portfolio_value: f64,
    /// Share of the starting value held as cash for premiums.
    pub cash_reserve_fraction: f64,
    pub contract_multiplier: f64,
    pub fee_per_contract: f64,
    pub synthesis: SynthesisSettings,
    /// Instant shock used for point-in-time protection ratios.
    pub stress_shock: StressShock,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            initial_portfolio_value: 100_000.0,
            cash_reserve_fraction: 0.10,
            contract_multiplier: 100.0,
            fee_per_contract: 1.0,
            synthesis: SynthesisSettings::default(),
            stress_shock: StressShock::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> HedgeResult<()> {
        if !self.initial_portfolio_value.is_finite() || self.initial_portfolio_value <= 0.0 {
            return Err(HedgeError::Config("initial portfolio value must be > 0".into()));
        }
        if !(self.cash_reserve_fraction > 0.0 && self.cash_reserve_fraction <= 1.0) {
            return Err(HedgeError::Config(format!(
                "cash reserve fraction must be in (0, 1], got {}",
                self.cash_reserve_fraction
            )));
        }
        if !self.contract_multiplier.is_finite() || self.contract_multiplier <= 0.0 {
            return Err(HedgeError::Config("contract multiplier must be > 0".into()));
        }
        if !self.fee_per_contract.is_finite() || self.fee_per_contract < 0.0 {
            return Err(HedgeError::Config("fee per contract must be >= 0".into()));
        }
        let s = &self.synthesis;
        if !(s.half_spread >= 0.0 && s.half_spread < 1.0) {
            return Err(HedgeError::Config("synthetic half spread must be in [0, 1)".into()));
        }
        self.stress_shock.validate()
    }

    #[inline]
    pub fn initial_cash(&self) -> f64 {
        self.initial_portfolio_value * self.cash_reserve_fraction
    }

    #[inline]
    pub fn initial_protected_value(&self) -> f64 {
        self.initial_portfolio_value - self.initial_cash()
    }
}

/// Process configuration read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub regime: RegimeConfig,
    pub jump: JumpParams,
    pub risk_free_rate: f64,
    pub scenario: StressProfile,
    pub scenario_start_spot: f64,
    pub parallel: bool,
    pub ranking: CompositeScore,
    pub strategies_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> HedgeResult<Self> {
        dotenvy::dotenv().ok();

        let initial_portfolio_value = parse_f64("INITIAL_PORTFOLIO_VALUE", "100000")?;
        let cash_reserve_fraction = parse_f64("CASH_RESERVE_FRACTION", "0.10")?;
        let risk_free_rate = parse_f64("RISK_FREE_RATE", "0.05")?;
        let fee_per_contract = parse_f64("TRANSACTION_COST_PER_CONTRACT", "1.00")?;
        let contract_multiplier = parse_f64("CONTRACT_MULTIPLIER", "100")?;

        let vix_thresholds = parse_thresholds(&env_var_or("VIX_THRESHOLDS", "15,25,40"))?;

        let jump = JumpParams {
            intensity: parse_f64("JUMP_INTENSITY", "0.1")?,
            mean: parse_f64("JUMP_MEAN", "-0.05")?,
            vol: parse_f64("JUMP_VOL", "0.15")?,
        };

        let scenario = env_var_or("STRESS_SCENARIO", "covid-2020")
            .parse::<StressProfile>()
            .map_err(|e| HedgeError::Config(format!("STRESS_SCENARIO: {e}")))?;

        let scenario_start_spot = parse_f64("SCENARIO_START_SPOT", "4500")?;

        let parallel = env_var_or("PARALLEL_RUNS", "true")
            .parse::<bool>()
            .map_err(|e| HedgeError::Config(format!("PARALLEL_RUNS: {e}")))?;

        let ranking = CompositeScore {
            protection_weight: parse_f64("RANK_PROTECTION_WEIGHT", "0.6")?,
            cost_weight: parse_f64("RANK_COST_WEIGHT", "0.4")?,
        };

        let strategies_path = std::env::var("STRATEGIES_PATH").ok().map(PathBuf::from);

        let cfg = Self {
            engine: EngineSettings {
                initial_portfolio_value,
                cash_reserve_fraction,
                contract_multiplier,
                fee_per_contract,
                ..EngineSettings::default()
            },
            regime: RegimeConfig::default().with_thresholds(vix_thresholds),
            jump,
            risk_free_rate,
            scenario,
            scenario_start_spot,
            parallel,
            ranking,
            strategies_path,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> HedgeResult<()> {
        self.engine.validate()?;
        self.regime.validate()?;
        self.jump.validate()?;
        if !self.risk_free_rate.is_finite() {
            return Err(HedgeError::Config("RISK_FREE_RATE must be finite".into()));
        }
        if !self.scenario_start_spot.is_finite() || self.scenario_start_spot <= 0.0 {
            return Err(HedgeError::Config("SCENARIO_START_SPOT must be > 0".into()));
        }
        self.ranking.validate()
    }
}

fn parse_f64(key: &str, default: &str) -> HedgeResult<f64> {
    env_var_or(key, default)
        .trim()
        .parse::<f64>()
        .map_err(|e| HedgeError::Config(format!("{key}: {e}")))
}

fn parse_thresholds(raw: &str) -> HedgeResult<[f64; 3]> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HedgeError::Config(format!("VIX_THRESHOLDS: {e}")))?;
    <[f64; 3]>::try_from(parts).map_err(|p| {
        HedgeError::Config(format!("VIX_THRESHOLDS: expected 3 values, got {}", p.len()))
    })
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thresholds() {
        assert_eq!(parse_thresholds("15, 25,40").unwrap(), [15.0, 25.0, 40.0]);
        assert!(parse_thresholds("15,25").is_err());
        assert!(parse_thresholds("a,b,c").is_err());
    }

    #[test]
    fn test_engine_settings_split() {
        let s = EngineSettings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.initial_cash(), 10_000.0);
        assert_eq!(s.initial_protected_value(), 90_000.0);
    }

    #[test]
    fn test_engine_settings_rejects_bad_values() {
        let s = EngineSettings { cash_reserve_fraction: 0.0, ..EngineSettings::default() };
        assert!(matches!(s.validate(), Err(HedgeError::Config(_))));
        let s = EngineSettings { fee_per_contract: -1.0, ..EngineSettings::default() };
        assert!(s.validate().is_err());
    }
}
