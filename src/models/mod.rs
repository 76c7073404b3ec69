pub mod black_scholes;
pub mod jump_diffusion;
pub mod regime;

use crate::errors::{HedgeError, HedgeResult};
use crate::models::black_scholes::BlackScholes;
use crate::models::jump_diffusion::JumpDiffusion;
use crate::models::regime::RegimeContext;
use crate::state::{intrinsic_value, Greeks, OptionType, PriceResult};
use serde::{Deserialize, Serialize};

/// All pricing models implement this trait.
/// price() must be a pure function of its inputs.
/// Send + Sync required for use across rayon workers.
pub trait PricingModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Price and Greeks for already-validated parameters.
    /// Never returns NaN: non-finite output is a NumericalInstability error.
    fn price(&self, params: &PricingParams) -> HedgeResult<PriceResult>;
}

/// Which pricing path a strategy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    BlackScholes,
    #[default]
    JumpDiffusion,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlackScholes => write!(f, "black_scholes"),
            Self::JumpDiffusion => write!(f, "jump_diffusion"),
        }
    }
}

/// Merton jump parameters. Fixed per engine, never fitted online.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JumpParams {
    /// Expected jumps per year.
    pub intensity: f64,
    /// Mean of the log jump size.
    pub mean: f64,
    /// Std dev of the log jump size.
    pub vol: f64,
}

impl Default for JumpParams {
    fn default() -> Self {
        Self {
            intensity: 0.1,
            mean: -0.05,
            vol: 0.15,
        }
    }
}

impl JumpParams {
    pub fn validate(&self) -> HedgeResult<()> {
        if !self.intensity.is_finite() || self.intensity < 0.0 {
            return Err(HedgeError::Config(format!("jump intensity must be >= 0, got {}", self.intensity)));
        }
        if !self.mean.is_finite() {
            return Err(HedgeError::Config("jump mean must be finite".into()));
        }
        if !self.vol.is_finite() || self.vol < 0.0 {
            return Err(HedgeError::Config(format!("jump vol must be >= 0, got {}", self.vol)));
        }
        Ok(())
    }

    /// Expected relative jump size k = E[J] - 1.
    #[inline]
    pub fn mean_jump(&self) -> f64 {
        (self.mean + 0.5 * self.vol * self.vol).exp() - 1.0
    }
}

/// Inputs to a single option valuation. `time_to_expiry` is in years.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingParams {
    pub spot: f64,
    pub strike: f64,
    pub time_to_expiry: f64,
    pub rate: f64,
    pub dividend_yield: f64,
    pub sigma: f64,
    pub option_type: OptionType,
}

impl PricingParams {
    pub fn new(
        spot: f64,
        strike: f64,
        time_to_expiry: f64,
        rate: f64,
        sigma: f64,
        option_type: OptionType,
    ) -> Self {
        Self {
            spot,
            strike,
            time_to_expiry,
            rate,
            dividend_yield: 0.0,
            sigma,
            option_type,
        }
    }

    pub fn with_dividend_yield(mut self, q: f64) -> Self {
        self.dividend_yield = q;
        self
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn with_time_to_expiry(mut self, t: f64) -> Self {
        self.time_to_expiry = t;
        self
    }

    pub fn validate(&self) -> HedgeResult<()> {
        if !self.spot.is_finite() || self.spot <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("spot must be > 0, got {}", self.spot)));
        }
        if !self.strike.is_finite() || self.strike <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("strike must be > 0, got {}", self.strike)));
        }
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("sigma must be > 0, got {}", self.sigma)));
        }
        if !self.time_to_expiry.is_finite() {
            return Err(HedgeError::InvalidInput("time to expiry must be finite".into()));
        }
        if !self.rate.is_finite() || !self.dividend_yield.is_finite() {
            return Err(HedgeError::InvalidInput("rates must be finite".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.time_to_expiry <= 0.0
    }

    #[inline]
    pub fn intrinsic(&self) -> f64 {
        intrinsic_value(self.option_type, self.spot, self.strike)
    }
}

/// Expired contract: intrinsic value, only delta survives.
pub(crate) fn expired_result(params: &PricingParams) -> PriceResult {
    let delta = match params.option_type {
        OptionType::Call if params.spot > params.strike => 1.0,
        OptionType::Put if params.spot < params.strike => -1.0,
        _ => 0.0,
    };
    PriceResult {
        price: params.intrinsic(),
        greeks: Greeks {
            delta,
            ..Greeks::default()
        },
    }
}

/// Reject non-finite output, clamp tiny negative prices from cancellation.
pub(crate) fn finalize(model: &'static str, result: PriceResult) -> HedgeResult<PriceResult> {
    if !result.price.is_finite() || !result.greeks.is_finite() {
        return Err(HedgeError::NumericalInstability(format!(
            "{model} produced non-finite output"
        )));
    }
    Ok(PriceResult {
        price: result.price.max(0.0),
        greeks: result.greeks,
    })
}

/// Front door for pricing: validates input, applies the regime vol
/// multiplier, then dispatches to the selected model.
pub struct PricingEngine {
    black_scholes: BlackScholes,
    jump_diffusion: JumpDiffusion,
}

impl PricingEngine {
    pub fn new(jump: JumpParams) -> HedgeResult<Self> {
        jump.validate()?;
        Ok(Self {
            black_scholes: BlackScholes::new(),
            jump_diffusion: JumpDiffusion::new(jump),
        })
    }

    #[inline]
    pub fn model(&self, kind: ModelKind) -> &dyn PricingModel {
        match kind {
            ModelKind::BlackScholes => &self.black_scholes,
            ModelKind::JumpDiffusion => &self.jump_diffusion,
        }
    }

    #[inline]
    pub fn black_scholes(&self) -> &BlackScholes {
        &self.black_scholes
    }

    /// Greeks come from the regime-adjusted surface since the multiplier is
    /// applied to sigma before either path runs.
    pub fn price(
        &self,
        kind: ModelKind,
        params: &PricingParams,
        regime: Option<&RegimeContext>,
    ) -> HedgeResult<PriceResult> {
        params.validate()?;
        let adjusted = match regime {
            Some(ctx) => params.with_sigma(params.sigma * ctx.pricing_multiplier),
            None => *params,
        };
        adjusted.validate()?;
        self.model(kind).price(&adjusted)
    }

    /// Relative premium of jump-diffusion over Black-Scholes, signed.
    /// Zero when the Black-Scholes price is zero.
    pub fn jump_risk_premium(
        &self,
        params: &PricingParams,
        regime: Option<&RegimeContext>,
    ) -> HedgeResult<f64> {
        let bs = self.price(ModelKind::BlackScholes, params, regime)?.price;
        let jd = self.price(ModelKind::JumpDiffusion, params, regime)?.price;
        if bs <= 0.0 {
            return Ok(0.0);
        }
        Ok((jd - bs) / bs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::regime::{RegimeAnalyzer, RegimeConfig, RegimeLabel};

    fn put(sigma: f64) -> PricingParams {
        PricingParams::new(100.0, 85.0, 0.25, 0.05, sigma, OptionType::Put)
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let engine = PricingEngine::new(JumpParams::default()).unwrap();
        for kind in [ModelKind::BlackScholes, ModelKind::JumpDiffusion] {
            let r = engine.price(kind, &put(0.0), None);
            assert!(matches!(r, Err(HedgeError::InvalidInput(_))), "sigma=0 must be rejected");
            let r = engine.price(kind, &put(-0.2), None);
            assert!(matches!(r, Err(HedgeError::InvalidInput(_))));
            let mut p = put(0.2);
            p.spot = f64::NAN;
            assert!(matches!(engine.price(kind, &p, None), Err(HedgeError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_bad_jump_params_rejected() {
        let jp = JumpParams { intensity: -1.0, ..JumpParams::default() };
        assert!(matches!(PricingEngine::new(jp), Err(HedgeError::Config(_))));
    }

    #[test]
    fn test_regime_scales_vol_before_pricing() {
        let engine = PricingEngine::new(JumpParams::default()).unwrap();
        let analyzer = RegimeAnalyzer::new(RegimeConfig::default()).unwrap();
        let ctx = analyzer.context_for(RegimeLabel::Crisis, 50.0, None);
        let base = put(0.2);

        for kind in [ModelKind::BlackScholes, ModelKind::JumpDiffusion] {
            let adjusted = engine.price(kind, &base, Some(&ctx)).unwrap();
            let direct = engine
                .price(kind, &base.with_sigma(0.2 * ctx.pricing_multiplier), None)
                .unwrap();
            assert!((adjusted.price - direct.price).abs() < 1e-12);
            assert!((adjusted.greeks.vega - direct.greeks.vega).abs() < 1e-12,
                "greeks must come from the adjusted surface");
            let unadjusted = engine.price(kind, &base, None).unwrap();
            assert!(adjusted.price > unadjusted.price);
        }
    }

    #[test]
    fn test_jump_risk_premium_positive_for_otm_put() {
        let engine = PricingEngine::new(JumpParams::default()).unwrap();
        let jrp = engine.jump_risk_premium(&put(0.2), None).unwrap();
        assert!(jrp > 0.0, "negative-mean jumps should fatten the left tail, jrp={jrp}");
    }

    #[test]
    fn test_expired_result() {
        let p = PricingParams::new(90.0, 100.0, 0.0, 0.05, 0.2, OptionType::Put);
        let r = expired_result(&p);
        assert_eq!(r.price, 10.0);
        assert_eq!(r.greeks.delta, -1.0);
        let c = PricingParams { option_type: OptionType::Call, ..p };
        let r = expired_result(&c);
        assert_eq!(r.price, 0.0);
        assert_eq!(r.greeks.delta, 0.0);
    }
}
