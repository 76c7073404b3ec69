use crate::errors::{HedgeError, HedgeResult};
use crate::models::{expired_result, finalize, PricingModel, PricingParams};
use crate::state::{Greeks, OptionType, PriceResult};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Implied-vol search bounds.
const IV_MIN: f64 = 0.001;
const IV_MAX: f64 = 5.0;
const IV_TOLERANCE: f64 = 1e-6;
const IV_MAX_ITER: usize = 100;

/// Black-Scholes-Merton European pricing with continuous dividend yield.
///
/// d1 = (ln(S/K) + (r - q + sigma^2/2) T) / (sigma sqrt(T))
/// d2 = d1 - sigma sqrt(T)
///
/// call = S e^{-qT} N(d1) - K e^{-rT} N(d2)
/// put  = K e^{-rT} N(-d2) - S e^{-qT} N(-d1)
pub struct BlackScholes {
    normal: Normal,
}

impl Default for BlackScholes {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackScholes {
    pub fn new() -> Self {
        Self {
            normal: Normal::standard(),
        }
    }

    #[inline]
    fn cdf(&self, x: f64) -> f64 {
        self.normal.cdf(x).clamp(0.0, 1.0)
    }

    /// Closed-form price and Greeks. Assumes T > 0 and sigma > 0.
    /// `rate` is used for both drift and discounting; the jump-diffusion
    /// model calls this with its per-term adjusted rate.
    pub(crate) fn evaluate(
        &self,
        spot: f64,
        strike: f64,
        t: f64,
        rate: f64,
        q: f64,
        sigma: f64,
        option_type: OptionType,
    ) -> PriceResult {
        let sqrt_t = t.sqrt();
        let sigma_sqrt_t = sigma * sqrt_t;
        let d1 = ((spot / strike).ln() + (rate - q + 0.5 * sigma * sigma) * t) / sigma_sqrt_t;
        let d2 = d1 - sigma_sqrt_t;

        let disc_q = (-q * t).exp();
        let disc_r = (-rate * t).exp();
        let pdf_d1 = self.normal.pdf(d1);

        let gamma = disc_q * pdf_d1 / (spot * sigma_sqrt_t);
        let vega = spot * disc_q * pdf_d1 * sqrt_t;
        let decay = -spot * disc_q * pdf_d1 * sigma / (2.0 * sqrt_t);

        match option_type {
            OptionType::Call => {
                let n_d1 = self.cdf(d1);
                let n_d2 = self.cdf(d2);
                PriceResult {
                    price: spot * disc_q * n_d1 - strike * disc_r * n_d2,
                    greeks: Greeks {
                        delta: disc_q * n_d1,
                        gamma,
                        theta: decay - rate * strike * disc_r * n_d2 + q * spot * disc_q * n_d1,
                        vega,
                        rho: strike * t * disc_r * n_d2,
                    },
                }
            }
            OptionType::Put => {
                let n_md1 = self.cdf(-d1);
                let n_md2 = self.cdf(-d2);
                PriceResult {
                    price: strike * disc_r * n_md2 - spot * disc_q * n_md1,
                    greeks: Greeks {
                        delta: -disc_q * n_md1,
                        gamma,
                        theta: decay + rate * strike * disc_r * n_md2 - q * spot * disc_q * n_md1,
                        vega,
                        rho: -strike * t * disc_r * n_md2,
                    },
                }
            }
        }
    }

    /// Solve for sigma such that the model price matches `target_price`.
    /// Newton steps on vega, falling back to bisection whenever a step
    /// leaves the current bracket.
    pub fn implied_vol(&self, target_price: f64, params: &PricingParams) -> HedgeResult<f64> {
        params.with_sigma(IV_MIN).validate()?;
        if params.is_expired() {
            return Err(HedgeError::InvalidInput("cannot imply vol for an expired option".into()));
        }
        if !target_price.is_finite() || target_price <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("target price must be > 0, got {target_price}")));
        }

        let price_at = |sigma: f64| {
            self.evaluate(
                params.spot,
                params.strike,
                params.time_to_expiry,
                params.rate,
                params.dividend_yield,
                sigma,
                params.option_type,
            )
        };

        let mut lo = IV_MIN;
        let mut hi = IV_MAX;
        if target_price < price_at(lo).price || target_price > price_at(hi).price {
            return Err(HedgeError::NumericalInstability(format!(
                "target price {target_price:.6} outside attainable range"
            )));
        }

        let mut sigma = 0.2_f64.clamp(lo, hi);
        for _ in 0..IV_MAX_ITER {
            let r = price_at(sigma);
            let diff = r.price - target_price;
            if diff.abs() < IV_TOLERANCE {
                return Ok(sigma);
            }
            if diff > 0.0 {
                hi = sigma;
            } else {
                lo = sigma;
            }
            let newton = if r.greeks.vega > 1e-10 {
                sigma - diff / r.greeks.vega
            } else {
                f64::NAN
            };
            sigma = if newton.is_finite() && newton > lo && newton < hi {
                newton
            } else {
                0.5 * (lo + hi)
            };
        }

        Err(HedgeError::NumericalInstability(format!(
            "implied vol did not converge for target {target_price:.6}"
        )))
    }
}

impl PricingModel for BlackScholes {
    #[inline]
    fn name(&self) -> &'static str {
        "Black-Scholes"
    }

    fn price(&self, params: &PricingParams) -> HedgeResult<PriceResult> {
        if params.is_expired() {
            return Ok(expired_result(params));
        }
        let result = self.evaluate(
            params.spot,
            params.strike,
            params.time_to_expiry,
            params.rate,
            params.dividend_yield,
            params.sigma,
            params.option_type,
        );
        finalize(self.name(), result)
    }
}
