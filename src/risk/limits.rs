/// Tolerance for floating-point noise at the allocation boundary.
const ALLOCATION_EPSILON: f64 = 1e-9;

/// Why a hedge purchase was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    InvalidPremium,
    InsufficientCash,
    MaxAllocation,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockReason::InvalidPremium => "invalid premium",
            BlockReason::InsufficientCash => "insufficient cash",
            BlockReason::MaxAllocation => "max allocation exceeded",
        })
    }
}

/// Risk limit check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCheck {
    /// Trade allowed
    Allowed,
    /// Blocked with reason
    Blocked(BlockReason),
}

/// Snapshot of the numbers an allocation decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct AllocationState {
    /// Market value of all open hedge positions.
    pub hedge_value: f64,
    /// Protected asset + cash + hedge value.
    pub total_value: f64,
    pub cash: f64,
    pub max_allocation: f64,
}

impl AllocationState {
    /// Allocation fraction after spending `premium` on hedges and `fees` on costs.
    #[inline]
    pub fn fraction_after(&self, premium: f64, fees: f64) -> f64 {
        let total = self.total_value - fees;
        if total <= 0.0 {
            return f64::INFINITY;
        }
        (self.hedge_value + premium) / total
    }

    #[inline]
    pub fn current_fraction(&self) -> f64 {
        self.fraction_after(0.0, 0.0)
    }
}

/// Check a proposed hedge purchase against allocation and cash limits.
/// Pure function, no side effects.
#[inline]
pub fn check_allocation(state: &AllocationState, premium: f64, fees: f64) -> RiskCheck {
    if !premium.is_finite() || premium < 0.0 || !fees.is_finite() || fees < 0.0 {
        return RiskCheck::Blocked(BlockReason::InvalidPremium);
    }
    if premium + fees > state.cash + ALLOCATION_EPSILON {
        return RiskCheck::Blocked(BlockReason::InsufficientCash);
    }
    if state.fraction_after(premium, fees) > state.max_allocation + ALLOCATION_EPSILON {
        return RiskCheck::Blocked(BlockReason::MaxAllocation);
    }
    RiskCheck::Allowed
}

/// Dollar budget for a new hedge: the strategy's allocation fraction scaled
/// by the regime, capped at the maximum allocation.
#[inline]
pub fn hedge_budget(
    allocation_fraction: f64,
    regime_multiplier: f64,
    max_allocation: f64,
    total_value: f64,
) -> f64 {
    let fraction = (allocation_fraction * regime_multiplier).min(max_allocation).max(0.0);
    fraction * total_value.max(0.0)
}

/// Whole contracts affordable within `budget`, the remaining allocation
/// headroom and available cash.
///
/// Headroom solves (H + n*p*m) / (T - n*fee) <= max for n.
pub fn size_contracts(state: &AllocationState, budget: f64, unit_price: f64, multiplier: f64, fee: f64) -> f64 {
    let unit_premium = unit_price * multiplier;
    if !unit_premium.is_finite() || unit_premium <= 0.0 {
        return 0.0;
    }
    let unit_cost = unit_premium + fee;
    let by_budget = budget / unit_cost;
    let by_cash = state.cash / unit_cost;
    let by_headroom = (state.max_allocation * state.total_value - state.hedge_value)
        / (unit_premium + state.max_allocation * fee);
    by_budget.min(by_cash).min(by_headroom).max(0.0).floor()
}
