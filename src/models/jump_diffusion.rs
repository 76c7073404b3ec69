use crate::errors::{HedgeError, HedgeResult};
use crate::models::black_scholes::BlackScholes;
use crate::models::{expired_result, finalize, JumpParams, PricingModel, PricingParams};
use crate::state::{Greeks, PriceResult};

/// Merton (1976) jump-diffusion European pricing.
///
/// V = sum_{n>=0} [e^{-l'T} (l'T)^n / n!] * BS(S, K, T, r_n, sigma_n)
///
/// where k = e^{mu + delta^2/2} - 1, l' = lambda (1 + k),
/// r_n = r - lambda k + n ln(1 + k) / T and sigma_n^2 = sigma^2 + n delta^2 / T.
///
/// The Poisson sum is truncated once the remaining probability mass drops
/// below `TAIL_TOLERANCE`.
const TAIL_TOLERANCE: f64 = 1e-12;

/// Hard cap on Poisson terms.
const MAX_TERMS: usize = 50;

/// Residual mass tolerated at the hard cap before giving up.
const MAX_RESIDUAL: f64 = 1e-6;

pub struct JumpDiffusion {
    bs: BlackScholes,
    jump: JumpParams,
}

impl JumpDiffusion {
    pub fn new(jump: JumpParams) -> Self {
        Self {
            bs: BlackScholes::new(),
            jump,
        }
    }

    #[inline]
    pub fn jump_params(&self) -> &JumpParams {
        &self.jump
    }

    /// Poisson-weighted sum of Black-Scholes terms. Theta is filled in by the caller.
    fn weighted_sum(&self, params: &PricingParams) -> HedgeResult<PriceResult> {
        let t = params.time_to_expiry;
        let sigma_sq = params.sigma * params.sigma;
        let k = self.jump.mean_jump();
        let lambda = self.jump.intensity;
        let lambda_prime_t = lambda * (1.0 + k) * t;
        let log_one_plus_k = (1.0 + k).ln();
        let delta_sq = self.jump.vol * self.jump.vol;

        let mut weight = (-lambda_prime_t).exp();
        let mut remaining = 1.0_f64;
        let mut price = 0.0_f64;
        let mut greeks = Greeks::default();

        for n in 0..MAX_TERMS {
            if n > 0 {
                weight *= lambda_prime_t / n as f64;
            }
            let nf = n as f64;
            let sigma_n = (sigma_sq + nf * delta_sq / t).sqrt();
            let r_n = params.rate - lambda * k + nf * log_one_plus_k / t;

            let term = self.bs.evaluate(
                params.spot,
                params.strike,
                t,
                r_n,
                params.dividend_yield,
                sigma_n,
                params.option_type,
            );

            price += weight * term.price;
            greeks.delta += weight * term.greeks.delta;
            greeks.gamma += weight * term.greeks.gamma;
            // d(sigma_n)/d(sigma) = sigma / sigma_n
            greeks.vega += weight * term.greeks.vega * params.sigma / sigma_n;
            greeks.rho += weight * term.greeks.rho;

            remaining -= weight;
            if remaining < TAIL_TOLERANCE {
                return Ok(PriceResult { price, greeks });
            }
        }

        if remaining > MAX_RESIDUAL {
            return Err(HedgeError::NumericalInstability(format!(
                "jump series truncated with residual mass {remaining:.3e}"
            )));
        }
        Ok(PriceResult { price, greeks })
    }
}

impl PricingModel for JumpDiffusion {
    #[inline]
    fn name(&self) -> &'static str {
        "Jump-Diffusion"
    }

    fn price(&self, params: &PricingParams) -> HedgeResult<PriceResult> {
        if params.is_expired() {
            return Ok(expired_result(params));
        }

        if self.jump.intensity <= 0.0 {
            return self.bs.price(params);
        }

        let mut result = self.weighted_sum(params)?;

        // Theta by backward difference in T; weights and r_n both depend on T.
        let t = params.time_to_expiry;
        let h = (1.0 / 365.0_f64).min(0.5 * t);
        let shorter = params.with_time_to_expiry(t - h);
        let earlier_price = if shorter.is_expired() {
            shorter.intrinsic()
        } else {
            self.weighted_sum(&shorter)?.price
        };
        result.greeks.theta = (earlier_price - result.price) / h;

        finalize(self.name(), result)
    }
}
