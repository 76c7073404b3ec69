use crate::errors::{HedgeError, HedgeResult};
use crate::state::MarketSnapshot;
use serde::{Deserialize, Serialize};

/// Surface points within this distance of ATM (strike/spot = 1) feed the slope estimate.
const ATM_BAND: f64 = 0.05;

/// Horizon at which the transition matrix is fully mean-reverted.
const FULL_HORIZON_DAYS: f64 = 30.0;

/// One-period persistence matrix. Rows: current regime, columns: next regime.
const TRANSITION_MATRIX: [[f64; 4]; 4] = [
    [0.85, 0.12, 0.03, 0.00],
    [0.20, 0.60, 0.18, 0.02],
    [0.05, 0.25, 0.60, 0.10],
    [0.01, 0.09, 0.50, 0.40],
];

// ── Regime Labels ──

/// Ordered volatility regimes: Low < Normal < Elevated < Crisis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeLabel {
    Low,
    Normal,
    Elevated,
    Crisis,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 4] = [
        RegimeLabel::Low,
        RegimeLabel::Normal,
        RegimeLabel::Elevated,
        RegimeLabel::Crisis,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::Elevated => write!(f, "elevated"),
            Self::Crisis => write!(f, "crisis"),
        }
    }
}

// ── Configuration ──

/// Per-regime adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAdjustment {
    /// Scales sigma before pricing.
    pub pricing_multiplier: f64,
    /// Scales the strategy's target allocation.
    pub allocation_multiplier: f64,
    /// Long-dated minus short-dated IV when no surface sample is available.
    pub default_term_slope: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// VIX cut points between low/normal, normal/elevated, elevated/crisis.
    pub vix_thresholds: [f64; 3],
    /// Indexed by `RegimeLabel::index`.
    pub adjustments: [RegimeAdjustment; 4],
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            vix_thresholds: [15.0, 25.0, 40.0],
            adjustments: [
                RegimeAdjustment { pricing_multiplier: 1.00, allocation_multiplier: 1.0, default_term_slope: 0.020 },
                RegimeAdjustment { pricing_multiplier: 1.05, allocation_multiplier: 1.3, default_term_slope: 0.005 },
                RegimeAdjustment { pricing_multiplier: 1.15, allocation_multiplier: 1.8, default_term_slope: -0.020 },
                RegimeAdjustment { pricing_multiplier: 1.30, allocation_multiplier: 2.5, default_term_slope: -0.080 },
            ],
        }
    }
}

impl RegimeConfig {
    pub fn with_thresholds(mut self, thresholds: [f64; 3]) -> Self {
        self.vix_thresholds = thresholds;
        self
    }

    pub fn validate(&self) -> HedgeResult<()> {
        let t = &self.vix_thresholds;
        if t.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(HedgeError::Config("VIX thresholds must be finite and >= 0".into()));
        }
        if !(t[0] < t[1] && t[1] < t[2]) {
            return Err(HedgeError::Config(format!(
                "VIX thresholds must be strictly increasing, got {t:?}"
            )));
        }
        for (label, adj) in RegimeLabel::ALL.iter().zip(&self.adjustments) {
            if !adj.pricing_multiplier.is_finite() || adj.pricing_multiplier <= 0.0 {
                return Err(HedgeError::Config(format!("{label}: pricing multiplier must be > 0")));
            }
            if !adj.allocation_multiplier.is_finite() || adj.allocation_multiplier <= 0.0 {
                return Err(HedgeError::Config(format!("{label}: allocation multiplier must be > 0")));
            }
            if !adj.default_term_slope.is_finite() {
                return Err(HedgeError::Config(format!("{label}: term slope must be finite")));
            }
        }
        if self
            .adjustments
            .windows(2)
            .any(|w| w[1].pricing_multiplier < w[0].pricing_multiplier)
        {
            return Err(HedgeError::Config(
                "pricing multipliers must be non-decreasing from low to crisis".into(),
            ));
        }
        Ok(())
    }
}

// ── Classification Output ──

/// Derived from one snapshot; never stored on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeContext {
    pub label: RegimeLabel,
    pub vix: f64,
    pub pricing_multiplier: f64,
    pub allocation_multiplier: f64,
    /// Long-dated minus short-dated implied vol.
    pub term_structure_slope: f64,
}

impl RegimeContext {
    /// Short-dated vol above long-dated.
    #[inline]
    pub fn is_inverted(&self) -> bool {
        self.term_structure_slope < 0.0
    }
}

/// Stateless VIX-band classifier. A pure function of config and snapshot,
/// so one instance is shared read-only across parallel runs.
#[derive(Debug, Clone)]
pub struct RegimeAnalyzer {
    config: RegimeConfig,
}

impl RegimeAnalyzer {
    pub fn new(config: RegimeConfig) -> HedgeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[inline]
    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Direct threshold lookup, lower bound inclusive. No hysteresis.
    #[inline]
    pub fn classify_vix(&self, vix: f64) -> RegimeLabel {
        let [low, normal, elevated] = self.config.vix_thresholds;
        if vix < low {
            RegimeLabel::Low
        } else if vix < normal {
            RegimeLabel::Normal
        } else if vix < elevated {
            RegimeLabel::Elevated
        } else {
            RegimeLabel::Crisis
        }
    }

    pub fn classify(&self, snapshot: &MarketSnapshot) -> RegimeContext {
        let label = self.classify_vix(snapshot.vix);
        let ctx = self.context_for(label, snapshot.vix, surface_slope(snapshot));
        tracing::debug!(
            regime = %ctx.label,
            vix = snapshot.vix,
            slope = ctx.term_structure_slope,
            "classified regime"
        );
        ctx
    }

    /// Build a context for a known label. `observed_slope` overrides the
    /// regime's default term slope when present.
    pub fn context_for(&self, label: RegimeLabel, vix: f64, observed_slope: Option<f64>) -> RegimeContext {
        let adj = &self.config.adjustments[label.index()];
        RegimeContext {
            label,
            vix,
            pricing_multiplier: adj.pricing_multiplier,
            allocation_multiplier: adj.allocation_multiplier,
            term_structure_slope: observed_slope.unwrap_or(adj.default_term_slope),
        }
    }

    /// Probability of each regime after `horizon_days`, indexed by
    /// `RegimeLabel::index`. Longer horizons shift mass toward `Normal`.
    pub fn transition_probabilities(&self, current: RegimeLabel, horizon_days: u32) -> [f64; 4] {
        let mut probs = TRANSITION_MATRIX[current.index()];
        let horizon = (horizon_days as f64 / FULL_HORIZON_DAYS).min(1.0);
        if horizon > 0.5 {
            probs[RegimeLabel::Normal.index()] += (horizon - 0.5) * 0.3 * 0.2;
            let total: f64 = probs.iter().sum();
            for p in probs.iter_mut() {
                *p /= total;
            }
        }
        probs
    }
}

/// Long minus short ATM implied vol from the snapshot's surface sample.
/// Needs two distinct expiries inside the ATM band.
fn surface_slope(snapshot: &MarketSnapshot) -> Option<f64> {
    let mut atm = snapshot
        .iv_surface
        .iter()
        .filter(|p| (p.moneyness - 1.0).abs() <= ATM_BAND && p.implied_vol.is_finite());
    let first = atm.next()?;
    let (short, long) = atm.fold((first, first), |(s, l), p| {
        let s = if p.days_to_expiry < s.days_to_expiry { p } else { s };
        let l = if p.days_to_expiry > l.days_to_expiry { p } else { l };
        (s, l)
    });
    if long.days_to_expiry <= short.days_to_expiry {
        return None;
    }
    Some(long.implied_vol - short.implied_vol)
}
