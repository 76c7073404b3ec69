use crate::errors::{HedgeError, HedgeResult};
use crate::models::regime::RegimeContext;
use crate::models::{PricingEngine, PricingParams};
use crate::state::{ChainEntry, MarketSnapshot, OptionContract, OptionType, DAYS_PER_YEAR};
use crate::strategy::definition::HedgingStrategyDefinition;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Strike distances closer than this are treated as a tie.
const STRIKE_TIE_EPSILON: f64 = 1e-9;

/// Listed strike spacings, smallest first.
const STRIKE_STEPS: [f64; 8] = [0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0];

/// How a contract set is synthesized when the snapshot carries no chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    /// Quoted bid/ask sit this fraction below/above the model price.
    pub half_spread: f64,
    /// Strikes generated on each side of the target.
    pub strikes_each_side: u32,
    pub volume: u64,
    pub open_interest: u64,
    /// Model prices below this quote a zero bid.
    pub min_price: f64,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            half_spread: 0.05,
            strikes_each_side: 5,
            volume: 100,
            open_interest: 1_000,
            min_price: 0.05,
        }
    }
}

/// Strike an entry aims for.
#[inline]
pub fn target_strike(spot: f64, target_otm_pct: f64) -> f64 {
    spot * (1.0 - target_otm_pct)
}

/// Pick the put closest to the OTM target inside the DTE window.
///
/// Illiquid entries are dropped before ranking. Ties on strike distance go
/// to higher open interest, then tighter spread. `exclude` drops the series
/// currently held so a roll never re-buys the same contract.
pub fn select_entry<'c>(
    chain: &'c [ChainEntry],
    as_of: NaiveDate,
    spot: f64,
    strategy: &HedgingStrategyDefinition,
    exclude: Option<&OptionContract>,
) -> HedgeResult<&'c ChainEntry> {
    let target = target_strike(spot, strategy.target_otm_pct);
    let min_dte = i64::from(strategy.min_dte);
    let max_dte = i64::from(strategy.max_dte);

    chain
        .iter()
        .filter(|e| e.option_type == OptionType::Put)
        .filter(|e| {
            let dte = (e.expiration - as_of).num_days();
            dte >= min_dte && dte <= max_dte
        })
        .filter(|e| strategy.liquidity.passes(e))
        .filter(|e| {
            exclude.map_or(true, |held| {
                !(held.strike() == e.strike && held.expiration() == e.expiration)
            })
        })
        .min_by(|a, b| {
            let da = (a.strike - target).abs();
            let db = (b.strike - target).abs();
            if (da - db).abs() > STRIKE_TIE_EPSILON {
                return da.total_cmp(&db);
            }
            b.open_interest
                .cmp(&a.open_interest)
                .then_with(|| (a.ask - a.bid).total_cmp(&(b.ask - b.bid)))
        })
        .ok_or_else(|| {
            HedgeError::StrategySkipped(format!(
                "no liquid put within {min_dte}-{max_dte} DTE near strike {target:.2}"
            ))
        })
}

/// Listed-style strike spacing for a given spot.
pub fn strike_step(spot: f64) -> f64 {
    let raw = spot * 0.001;
    STRIKE_STEPS
        .iter()
        .copied()
        .find(|s| *s >= raw)
        .unwrap_or(STRIKE_STEPS[STRIKE_STEPS.len() - 1])
}

/// Friday expirations inside [min_dte, max_dte]; falls back to the
/// window's far edge when the window holds no Friday.
pub fn weekly_expirations(as_of: NaiveDate, min_dte: u32, max_dte: u32) -> Vec<NaiveDate> {
    let mut out: Vec<NaiveDate> = (min_dte..=max_dte)
        .map(|d| as_of + Duration::days(i64::from(d)))
        .filter(|d| d.weekday() == Weekday::Fri)
        .collect();
    if out.is_empty() {
        out.push(as_of + Duration::days(i64::from(max_dte)));
    }
    out
}

/// Build a put chain around the strategy's target from model prices.
/// Deterministic for a given snapshot and strategy.
pub fn synthesize_chain(
    snapshot: &MarketSnapshot,
    strategy: &HedgingStrategyDefinition,
    engine: &PricingEngine,
    regime: &RegimeContext,
    settings: &SynthesisSettings,
) -> Vec<ChainEntry> {
    let as_of = snapshot.date();
    let step = strike_step(snapshot.spot);
    let center = (target_strike(snapshot.spot, strategy.target_otm_pct) / step).round() * step;
    let side = i64::from(settings.strikes_each_side);

    let mut chain = Vec::new();
    for expiration in weekly_expirations(as_of, strategy.min_dte, strategy.max_dte) {
        let dte = (expiration - as_of).num_days();
        for i in -side..=side {
            let strike = center + i as f64 * step;
            if strike <= 0.0 {
                continue;
            }
            let sigma = snapshot.implied_vol(dte as f64, strike / snapshot.spot);
            let params = PricingParams::new(
                snapshot.spot,
                strike,
                dte as f64 / DAYS_PER_YEAR,
                snapshot.risk_free_rate,
                sigma,
                OptionType::Put,
            )
            .with_dividend_yield(snapshot.dividend_yield);

            let price = match engine.price(strategy.pricing_model, &params, Some(regime)) {
                Ok(r) => r.price,
                Err(e) => {
                    tracing::warn!(strike = strike, dte = dte, error = %e, "skipping synthetic strike");
                    continue;
                }
            };
            let bid = if price >= settings.min_price {
                price * (1.0 - settings.half_spread)
            } else {
                0.0
            };
            chain.push(ChainEntry {
                strike,
                expiration,
                option_type: OptionType::Put,
                bid,
                ask: price * (1.0 + settings.half_spread),
                last: price,
                volume: settings.volume,
                open_interest: settings.open_interest,
            });
        }
    }
    chain
}
