use crate::errors::{HedgeError, HedgeResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::{Add, AddAssign};

/// Calendar days per year used for DTE -> year-fraction conversion.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Volatility used when a snapshot carries neither a surface nor a usable VIX.
pub const FALLBACK_VOL: f64 = 0.20;

// ── Option Contracts ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Put,
    Call,
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "put"),
            Self::Call => write!(f, "call"),
        }
    }
}

/// Market quote attached to a listed contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    pub open_interest: u64,
}

impl Quote {
    #[inline]
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            0.5 * (self.bid + self.ask)
        } else {
            self.last.max(self.bid).max(0.0)
        }
    }

    #[inline]
    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }
}

/// One row of an option chain as delivered by the data collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub strike: f64,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub last: f64,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,
}

impl ChainEntry {
    /// Entries with no bid, or with neither volume nor open interest, are unusable.
    #[inline]
    pub fn is_tradeable(&self) -> bool {
        self.bid > 0.0 && (self.volume > 0 || self.open_interest > 0)
    }

    pub fn quote(&self) -> Quote {
        Quote {
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            volume: self.volume,
            open_interest: self.open_interest,
        }
    }
}

/// An option contract. Fields are fixed at construction; a roll produces a
/// new contract rather than editing strike or expiry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionContract {
    underlying: String,
    strike: f64,
    expiration: NaiveDate,
    option_type: OptionType,
    quote: Option<Quote>,
}

impl OptionContract {
    pub fn new(
        underlying: impl Into<String>,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
        quote: Option<Quote>,
    ) -> HedgeResult<Self> {
        if !strike.is_finite() || strike <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("strike must be > 0, got {strike}")));
        }
        Ok(Self {
            underlying: underlying.into(),
            strike,
            expiration,
            option_type,
            quote,
        })
    }

    pub fn from_chain_entry(underlying: impl Into<String>, entry: &ChainEntry) -> HedgeResult<Self> {
        Self::new(
            underlying,
            entry.strike,
            entry.expiration,
            entry.option_type,
            Some(entry.quote()),
        )
    }

    #[inline]
    pub fn underlying(&self) -> &str {
        &self.underlying
    }

    #[inline]
    pub fn strike(&self) -> f64 {
        self.strike
    }

    #[inline]
    pub fn expiration(&self) -> NaiveDate {
        self.expiration
    }

    #[inline]
    pub fn option_type(&self) -> OptionType {
        self.option_type
    }

    #[inline]
    pub fn quote(&self) -> Option<&Quote> {
        self.quote.as_ref()
    }

    /// Calendar days from `as_of` to expiry. Negative once expired.
    #[inline]
    pub fn days_to_expiration(&self, as_of: NaiveDate) -> i64 {
        (self.expiration - as_of).num_days()
    }

    #[inline]
    pub fn years_to_expiration(&self, as_of: NaiveDate) -> f64 {
        self.days_to_expiration(as_of).max(0) as f64 / DAYS_PER_YEAR
    }

    #[inline]
    pub fn intrinsic(&self, spot: f64) -> f64 {
        intrinsic_value(self.option_type, spot, self.strike)
    }

    /// Same contract identity, with a fresh quote from a later chain.
    pub fn requoted(&self, quote: Option<Quote>) -> Self {
        Self { quote, ..self.clone() }
    }

    /// Identity key: underlying, strike, expiry and type.
    pub fn same_series(&self, other: &OptionContract) -> bool {
        self.underlying == other.underlying
            && self.strike == other.strike
            && self.expiration == other.expiration
            && self.option_type == other.option_type
    }
}

impl std::fmt::Display for OptionContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {:.2}",
            self.underlying, self.expiration, self.option_type, self.strike
        )
    }
}

#[inline]
pub fn intrinsic_value(option_type: OptionType, spot: f64, strike: f64) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

// ── Market Snapshots ──

/// A sampled point on the implied-volatility surface.
/// `moneyness` is strike / spot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvPoint {
    pub days_to_expiry: f64,
    pub moneyness: f64,
    pub implied_vol: f64,
}

/// Point-in-time market state. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub underlying: String,
    pub spot: f64,
    pub risk_free_rate: f64,
    pub vix: f64,
    #[serde(default)]
    pub dividend_yield: f64,
    #[serde(default)]
    pub iv_surface: Vec<IvPoint>,
    #[serde(default)]
    pub chain: Vec<ChainEntry>,
}

impl MarketSnapshot {
    pub fn new(
        timestamp: DateTime<Utc>,
        underlying: impl Into<String>,
        spot: f64,
        risk_free_rate: f64,
        vix: f64,
    ) -> Self {
        Self {
            timestamp,
            underlying: underlying.into(),
            spot,
            risk_free_rate,
            vix,
            dividend_yield: 0.0,
            iv_surface: Vec::new(),
            chain: Vec::new(),
        }
    }

    pub fn with_chain(mut self, chain: Vec<ChainEntry>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_iv_surface(mut self, surface: Vec<IvPoint>) -> Self {
        self.iv_surface = surface;
        self
    }

    pub fn with_dividend_yield(mut self, q: f64) -> Self {
        self.dividend_yield = q;
        self
    }

    #[inline]
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn validate(&self) -> HedgeResult<()> {
        if !self.spot.is_finite() || self.spot <= 0.0 {
            return Err(HedgeError::InvalidInput(format!("spot must be > 0, got {}", self.spot)));
        }
        if !self.vix.is_finite() || self.vix < 0.0 {
            return Err(HedgeError::InvalidInput(format!("vix must be >= 0, got {}", self.vix)));
        }
        if !self.risk_free_rate.is_finite() || !self.dividend_yield.is_finite() {
            return Err(HedgeError::InvalidInput("rates must be finite".into()));
        }
        Ok(())
    }

    /// Implied vol for a (dte, strike/spot) pair: nearest surface sample,
    /// else VIX / 100, else a flat fallback.
    pub fn implied_vol(&self, days_to_expiry: f64, moneyness: f64) -> f64 {
        let nearest = self
            .iv_surface
            .iter()
            .filter(|p| p.implied_vol.is_finite() && p.implied_vol > 0.0)
            .min_by(|a, b| {
                surface_distance(a, days_to_expiry, moneyness)
                    .total_cmp(&surface_distance(b, days_to_expiry, moneyness))
            });
        match nearest {
            Some(p) => p.implied_vol,
            None if self.vix > 0.0 => self.vix / 100.0,
            None => FALLBACK_VOL,
        }
    }
}

/// DTE measured in months so one month is comparable to 10% moneyness.
#[inline]
fn surface_distance(p: &IvPoint, dte: f64, moneyness: f64) -> f64 {
    let dt = (p.days_to_expiry - dte) / 30.0;
    let dm = (p.moneyness - moneyness) / 0.10;
    dt * dt + dm * dm
}

/// Chronologically ordered sequence of snapshots.
///
/// Deserialization goes through [`HistoricalScenario::new`], so a loaded
/// scenario carries the same ordering guarantees as a constructed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScenario")]
pub struct HistoricalScenario {
    pub name: String,
    snapshots: Vec<MarketSnapshot>,
}

#[derive(Deserialize)]
struct RawScenario {
    name: String,
    snapshots: Vec<MarketSnapshot>,
}

impl TryFrom<RawScenario> for HistoricalScenario {
    type Error = HedgeError;

    fn try_from(raw: RawScenario) -> HedgeResult<Self> {
        Self::new(raw.name, raw.snapshots)
    }
}

impl HistoricalScenario {
    /// Sorts by timestamp. Rejects empty input and duplicate timestamps.
    pub fn new(name: impl Into<String>, mut snapshots: Vec<MarketSnapshot>) -> HedgeResult<Self> {
        if snapshots.is_empty() {
            return Err(HedgeError::InvalidInput("scenario has no snapshots".into()));
        }
        snapshots.sort_by_key(|s| s.timestamp);
        if snapshots.windows(2).any(|w| w[0].timestamp == w[1].timestamp) {
            return Err(HedgeError::InvalidInput("duplicate snapshot timestamp".into()));
        }
        for s in &snapshots {
            s.validate()?;
        }
        Ok(Self {
            name: name.into(),
            snapshots,
        })
    }

    #[inline]
    pub fn snapshots(&self) -> &[MarketSnapshot] {
        &self.snapshots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Elapsed calendar days between the first and last snapshot.
    pub fn span_days(&self) -> f64 {
        match (self.snapshots.first(), self.snapshots.last()) {
            (Some(a), Some(b)) => (b.timestamp - a.timestamp).num_seconds() as f64 / 86_400.0,
            _ => 0.0,
        }
    }

    /// SHA-256 over the name and each snapshot's (timestamp, spot, vix, rate).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for s in &self.snapshots {
            hasher.update(s.timestamp.timestamp().to_le_bytes());
            hasher.update(s.spot.to_bits().to_le_bytes());
            hasher.update(s.vix.to_bits().to_le_bytes());
            hasher.update(s.risk_free_rate.to_bits().to_le_bytes());
            hasher.update((s.chain.len() as u64).to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

// ── Pricing Output ──

/// Price sensitivities. Theta is per year, vega per unit of vol, rho per unit of rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

impl Greeks {
    #[inline]
    pub fn scale(self, k: f64) -> Self {
        Self {
            delta: self.delta * k,
            gamma: self.gamma * k,
            theta: self.theta * k,
            vega: self.vega * k,
            rho: self.rho * k,
        }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.delta.is_finite()
            && self.gamma.is_finite()
            && self.theta.is_finite()
            && self.vega.is_finite()
            && self.rho.is_finite()
    }
}

impl Add for Greeks {
    type Output = Greeks;

    fn add(self, rhs: Greeks) -> Greeks {
        Greeks {
            delta: self.delta + rhs.delta,
            gamma: self.gamma + rhs.gamma,
            theta: self.theta + rhs.theta,
            vega: self.vega + rhs.vega,
            rho: self.rho + rhs.rho,
        }
    }
}

impl AddAssign for Greeks {
    fn add_assign(&mut self, rhs: Greeks) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceResult {
    pub price: f64,
    pub greeks: Greeks,
}
