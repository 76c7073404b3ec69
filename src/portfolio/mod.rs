pub mod position;

pub use position::{Position, PositionId, PositionStatus};

use crate::errors::{HedgeError, HedgeResult};
use crate::risk::limits::{self, AllocationState, BlockReason, RiskCheck};
use crate::state::{Greeks, OptionContract};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Static portfolio parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortfolioSettings {
    pub max_allocation: f64,
    pub contract_multiplier: f64,
    pub fee_per_contract: f64,
}

impl PortfolioSettings {
    pub fn validate(&self) -> HedgeResult<()> {
        if !(self.max_allocation > 0.0 && self.max_allocation <= 1.0) {
            return Err(HedgeError::Config(format!(
                "max_allocation must be in (0, 1], got {}",
                self.max_allocation
            )));
        }
        if !self.contract_multiplier.is_finite() || self.contract_multiplier <= 0.0 {
            return Err(HedgeError::Config("contract multiplier must be > 0".into()));
        }
        if !self.fee_per_contract.is_finite() || self.fee_per_contract < 0.0 {
            return Err(HedgeError::Config("fee per contract must be >= 0".into()));
        }
        Ok(())
    }
}

/// Protected asset, cash and the hedge positions bought with that cash.
///
/// Positions are owned exclusively by the portfolio. Closed positions stay
/// in the book for attribution but reject further marks.
///
/// The allocation limit is enforced on `open` and `roll`. A mark can push the
/// fraction above the limit when the hedge pays off; that is the point of it.
#[derive(Debug, Clone)]
pub struct Portfolio {
    protected_value: f64,
    cash: f64,
    positions: BTreeMap<PositionId, Position>,
    next_id: u64,
    settings: PortfolioSettings,
    total_premium_paid: f64,
    total_proceeds: f64,
    total_fees: f64,
}

impl Portfolio {
    pub fn new(protected_value: f64, cash: f64, settings: PortfolioSettings) -> HedgeResult<Self> {
        settings.validate()?;
        if !protected_value.is_finite() || protected_value < 0.0 || !cash.is_finite() || cash < 0.0 {
            return Err(HedgeError::Config(format!(
                "portfolio values must be finite and >= 0 (asset={protected_value}, cash={cash})"
            )));
        }
        Ok(Self {
            protected_value,
            cash,
            positions: BTreeMap::new(),
            next_id: 1,
            settings,
            total_premium_paid: 0.0,
            total_proceeds: 0.0,
            total_fees: 0.0,
        })
    }

    // ── Queries ──

    #[inline]
    pub fn settings(&self) -> &PortfolioSettings {
        &self.settings
    }

    #[inline]
    pub fn cash(&self) -> f64 {
        self.cash
    }

    #[inline]
    pub fn protected_value(&self) -> f64 {
        self.protected_value
    }

    /// Market value of open positions.
    pub fn hedge_value(&self) -> f64 {
        self.open_positions().map(Position::market_value).sum()
    }

    pub fn total_value(&self) -> f64 {
        self.protected_value + self.cash + self.hedge_value()
    }

    pub fn allocation_fraction(&self) -> f64 {
        self.allocation_state().current_fraction()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.open_positions().map(Position::unrealized_pnl).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    #[inline]
    pub fn total_premium_paid(&self) -> f64 {
        self.total_premium_paid
    }

    #[inline]
    pub fn total_proceeds(&self) -> f64 {
        self.total_proceeds
    }

    #[inline]
    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    pub fn greeks(&self) -> Greeks {
        self.open_positions()
            .fold(Greeks::default(), |acc, p| acc + p.position_greeks())
    }

    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_positions().count()
    }

    pub fn allocation_state(&self) -> AllocationState {
        let hedge_value = self.hedge_value();
        AllocationState {
            hedge_value,
            total_value: self.protected_value + self.cash + hedge_value,
            cash: self.cash,
            max_allocation: self.settings.max_allocation,
        }
    }

    /// Allocation as it would look after selling all of `id` at `exit_price`.
    pub fn allocation_state_after_exit(&self, id: PositionId, exit_price: f64) -> HedgeResult<AllocationState> {
        let p = self.open_position_ref(id)?;
        let current = self.allocation_state();
        let proceeds = exit_price * p.quantity * self.settings.contract_multiplier;
        let fees = p.quantity * self.settings.fee_per_contract;
        let old_value = p.market_value();
        Ok(AllocationState {
            hedge_value: current.hedge_value - old_value,
            total_value: current.total_value - old_value + proceeds - fees,
            cash: current.cash + proceeds - fees,
            max_allocation: current.max_allocation,
        })
    }

    // ── Mutations ──

    /// Mark the protected asset to a new value (e.g. after a spot move).
    pub fn revalue_protected_asset(&mut self, value: f64) -> HedgeResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(HedgeError::InvalidInput(format!("protected value must be >= 0, got {value}")));
        }
        self.protected_value = value;
        Ok(())
    }

    /// Buy `quantity` contracts at `price` per unit.
    /// Fails with AllocationExceeded if the post-trade fraction would exceed the max.
    pub fn open(
        &mut self,
        contract: OptionContract,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
    ) -> HedgeResult<PositionId> {
        validate_trade(quantity, price)?;
        let premium = price * quantity * self.settings.contract_multiplier;
        let fees = quantity * self.settings.fee_per_contract;
        self.check(&self.allocation_state(), premium, fees)?;

        let id = self.insert(contract, quantity, price, at, premium, fees);
        tracing::info!(
            position = %id,
            quantity = quantity,
            price = price,
            premium = premium,
            allocation = self.allocation_fraction(),
            "opened hedge"
        );
        Ok(id)
    }

    /// Update the mark for one position. Marks at or before the last mark
    /// time are ignored, so replaying a snapshot is a no-op.
    pub fn mark(
        &mut self,
        id: PositionId,
        new_price: f64,
        new_greeks: Greeks,
        at: DateTime<Utc>,
    ) -> HedgeResult<()> {
        if !new_price.is_finite() || new_price < 0.0 {
            return Err(HedgeError::InvalidInput(format!("mark price must be >= 0, got {new_price}")));
        }
        let position = self.open_position_mut(id)?;
        if position.last_marked_at.is_some_and(|last| at <= last) {
            return Ok(());
        }
        position.current_price = new_price;
        position.greeks = new_greeks;
        position.last_marked_at = Some(at);
        position.peak_value = position.peak_value.max(position.market_value());
        tracing::debug!(position = %id, price = new_price, value = position.market_value(), "marked");
        Ok(())
    }

    /// Record that trigger `index` fired for `id`. Returns false if it already had.
    pub fn record_trigger(&mut self, id: PositionId, index: usize) -> HedgeResult<bool> {
        Ok(self.open_position_mut(id)?.mark_fired(index))
    }

    /// Sell the whole remaining quantity. Terminal. Returns realized P&L.
    pub fn close(&mut self, id: PositionId, exit_price: f64, at: DateTime<Utc>) -> HedgeResult<f64> {
        self.reduce(id, 1.0, exit_price, at)
    }

    /// Sell `fraction` of the remaining quantity; a fraction of 1 closes the position.
    /// Returns realized P&L for the sold part, net of fees.
    pub fn reduce(
        &mut self,
        id: PositionId,
        fraction: f64,
        exit_price: f64,
        at: DateTime<Utc>,
    ) -> HedgeResult<f64> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(HedgeError::InvalidInput(format!("exit fraction must be in (0, 1], got {fraction}")));
        }
        if !exit_price.is_finite() || exit_price < 0.0 {
            return Err(HedgeError::InvalidInput(format!("exit price must be >= 0, got {exit_price}")));
        }
        let multiplier = self.settings.contract_multiplier;
        let fee = self.settings.fee_per_contract;
        let position = self.open_position_mut(id)?;

        let sold = position.quantity * fraction;
        let proceeds = exit_price * sold * multiplier;
        let fees = sold * fee;
        let pnl = (exit_price - position.entry_price) * sold * multiplier - fees;

        position.realized_pnl += pnl;
        position.current_price = exit_price;
        if fraction >= 1.0 {
            position.quantity = 0.0;
            position.status = PositionStatus::Closed;
            position.closed_at = Some(at);
        } else {
            position.quantity -= sold;
        }
        let closed = !position.is_open();

        self.cash += proceeds - fees;
        self.total_proceeds += proceeds;
        self.total_fees += fees;

        tracing::info!(
            position = %id,
            sold = sold,
            exit_price = exit_price,
            pnl = pnl,
            closed = closed,
            "reduced hedge"
        );
        Ok(pnl)
    }

    /// Close `old` and open a replacement as one step. Either both legs
    /// apply or neither does.
    #[allow(clippy::too_many_arguments)]
    pub fn roll(
        &mut self,
        old: PositionId,
        exit_price: f64,
        contract: OptionContract,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
    ) -> HedgeResult<PositionId> {
        validate_trade(quantity, price)?;
        if !exit_price.is_finite() || exit_price < 0.0 {
            return Err(HedgeError::InvalidInput(format!("exit price must be >= 0, got {exit_price}")));
        }
        let after_sale = self.allocation_state_after_exit(old, exit_price)?;
        let premium = price * quantity * self.settings.contract_multiplier;
        let buy_fees = quantity * self.settings.fee_per_contract;
        self.check(&after_sale, premium, buy_fees)?;

        self.reduce(old, 1.0, exit_price, at)?;
        let id = self.insert(contract, quantity, price, at, premium, buy_fees);
        tracing::info!(from = %old, to = %id, quantity = quantity, premium = premium, "rolled hedge");
        Ok(id)
    }

    // ── Internals ──

    fn check(&self, state: &AllocationState, premium: f64, fees: f64) -> HedgeResult<()> {
        match limits::check_allocation(state, premium, fees) {
            RiskCheck::Allowed => Ok(()),
            RiskCheck::Blocked(BlockReason::InsufficientCash) => Err(HedgeError::InsufficientCash {
                needed: premium + fees,
                available: state.cash,
            }),
            RiskCheck::Blocked(BlockReason::InvalidPremium) => {
                Err(HedgeError::InvalidInput(format!("invalid premium {premium}")))
            }
            RiskCheck::Blocked(BlockReason::MaxAllocation) => Err(HedgeError::AllocationExceeded {
                requested: state.fraction_after(premium, fees),
                max: state.max_allocation,
            }),
        }
    }

    fn insert(
        &mut self,
        contract: OptionContract,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
        premium: f64,
        fees: f64,
    ) -> PositionId {
        let id = PositionId(self.next_id);
        self.next_id += 1;
        let position = Position::new(id, contract, quantity, price, self.settings.contract_multiplier, at);
        self.cash -= premium + fees;
        self.total_premium_paid += premium;
        self.total_fees += fees;
        self.positions.insert(id, position);
        id
    }

    fn open_position_ref(&self, id: PositionId) -> HedgeResult<&Position> {
        match self.positions.get(&id) {
            None => Err(HedgeError::UnknownPosition(id)),
            Some(p) if !p.is_open() => Err(HedgeError::PositionClosed(id)),
            Some(p) => Ok(p),
        }
    }

    fn open_position_mut(&mut self, id: PositionId) -> HedgeResult<&mut Position> {
        match self.positions.get_mut(&id) {
            None => Err(HedgeError::UnknownPosition(id)),
            Some(p) if !p.is_open() => Err(HedgeError::PositionClosed(id)),
            Some(p) => Ok(p),
        }
    }
}

fn validate_trade(quantity: f64, price: f64) -> HedgeResult<()> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(HedgeError::InvalidInput(format!("quantity must be > 0, got {quantity}")));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(HedgeError::InvalidInput(format!("price must be > 0, got {price}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OptionType;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 16, 0, 0).unwrap()
    }

    fn contract(strike: f64, month: u32) -> OptionContract {
        OptionContract::new(
            "SPX",
            strike,
            NaiveDate::from_ymd_opt(2024, month, 15).unwrap(),
            OptionType::Put,
            None,
        )
        .unwrap()
    }

    fn portfolio() -> Portfolio {
        Portfolio::new(
            90_000.0,
            10_000.0,
            PortfolioSettings {
                max_allocation: 0.05,
                contract_multiplier: 100.0,
                fee_per_contract: 1.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_open_debits_cash_and_tracks_allocation() {
        let mut pf = portfolio();
        let id = pf.open(contract(3800.0, 3), 2.0, 10.0, t0()).unwrap();
        assert_eq!(pf.cash(), 10_000.0 - 2_000.0 - 2.0);
        assert_eq!(pf.hedge_value(), 2_000.0);
        assert!((pf.total_value() - 99_998.0).abs() < 1e-9);
        assert!(pf.allocation_fraction() <= 0.05);
        assert_eq!(pf.get(id).unwrap().premium_paid, 2_000.0);
    }

    #[test]
    fn test_open_rejects_over_allocation() {
        let mut pf = portfolio();
        let r = pf.open(contract(3800.0, 3), 6.0, 10.0, t0());
        assert!(matches!(r, Err(HedgeError::AllocationExceeded { max, .. }) if max == 0.05));
        assert_eq!(pf.cash(), 10_000.0, "rejected open must not touch cash");
        assert_eq!(pf.open_count(), 0);
    }

    #[test]
    fn test_open_maps_block_reasons_to_errors() {
        let settings = PortfolioSettings { max_allocation: 0.05, contract_multiplier: 100.0, fee_per_contract: 1.0 };
        let mut pf = Portfolio::new(1_000_000.0, 100.0, settings).unwrap();
        let r = pf.open(contract(3800.0, 3), 2.0, 10.0, t0());
        assert!(
            matches!(r, Err(HedgeError::InsufficientCash { needed, available }) if needed == 2_002.0 && available == 100.0),
            "got {r:?}"
        );
        assert_eq!(pf.cash(), 100.0);
    }

    #[test]
    fn test_allocation_invariant_over_open_close_sequence() {
        let mut pf = portfolio();
        let mut ids = Vec::new();
        let mut t = t0();
        for step in 0..40u32 {
            t += Duration::days(1);
            let qty = (step % 4 + 1) as f64;
            let price = 3.0 + (step % 7) as f64;
            if step % 3 == 2 {
                if let Some(id) = ids.pop() {
                    let exit = pf.get(id).unwrap().current_price;
                    pf.close(id, exit, t).unwrap();
                }
            } else {
                match pf.open(contract(3800.0 + step as f64, 3), qty, price, t) {
                    Ok(id) => ids.push(id),
                    Err(HedgeError::AllocationExceeded { .. }) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            assert!(
                pf.allocation_fraction() <= 0.05 + 1e-9,
                "step {step}: fraction {}",
                pf.allocation_fraction()
            );
        }
    }

    #[test]
    fn test_mark_is_idempotent_and_ignores_stale() {
        let mut pf = portfolio();
        let id = pf.open(contract(3800.0, 3), 1.0, 10.0, t0()).unwrap();
        let t1 = t0() + Duration::days(1);
        pf.mark(id, 12.0, Greeks::default(), t1).unwrap();
        pf.mark(id, 50.0, Greeks::default(), t1).unwrap();
        assert_eq!(pf.get(id).unwrap().current_price, 12.0, "same-time mark must be a no-op");
        pf.mark(id, 7.0, Greeks::default(), t0()).unwrap();
        assert_eq!(pf.get(id).unwrap().current_price, 12.0, "stale mark must be ignored");
        pf.mark(id, 15.0, Greeks::default(), t1 + Duration::days(1)).unwrap();
        assert_eq!(pf.get(id).unwrap().current_price, 15.0);
        assert_eq!(pf.get(id).unwrap().peak_value, 1_500.0);
    }

    #[test]
    fn test_close_is_terminal() {
        let mut pf = portfolio();
        let id = pf.open(contract(3800.0, 3), 1.0, 10.0, t0()).unwrap();
        let pnl = pf.close(id, 30.0, t0() + Duration::days(3)).unwrap();
        assert!((pnl - (2_000.0 - 1.0)).abs() < 1e-9);
        let r = pf.mark(id, 31.0, Greeks::default(), t0() + Duration::days(4));
        assert_eq!(r, Err(HedgeError::PositionClosed(id)));
        assert!(matches!(pf.close(id, 1.0, t0()), Err(HedgeError::PositionClosed(_))));
        assert!(matches!(
            pf.mark(PositionId(99), 1.0, Greeks::default(), t0()),
            Err(HedgeError::UnknownPosition(_))
        ));
    }

    #[test]
    fn test_partial_reduce() {
        let mut pf = portfolio();
        let id = pf.open(contract(3800.0, 3), 2.0, 10.0, t0()).unwrap();
        pf.reduce(id, 0.5, 40.0, t0() + Duration::days(1)).unwrap();
        let p = pf.get(id).unwrap();
        assert!(p.is_open());
        assert_eq!(p.quantity, 1.0);
        assert!((p.realized_pnl - (3_000.0 - 1.0)).abs() < 1e-9);
        assert!(pf.reduce(id, 1.5, 40.0, t0()).is_err());
    }

    #[test]
    fn test_roll_is_atomic() {
        let mut pf = portfolio();
        let old = pf.open(contract(3800.0, 3), 2.0, 10.0, t0()).unwrap();
        let t1 = t0() + Duration::days(20);

        // Replacement too large: nothing changes.
        let cash_before = pf.cash();
        let r = pf.roll(old, 5.0, contract(3900.0, 5), 3.0, 20.0, t1);
        assert!(matches!(r, Err(HedgeError::AllocationExceeded { .. })));
        assert!(pf.get(old).unwrap().is_open());
        assert_eq!(pf.cash(), cash_before);
        assert_eq!(pf.open_count(), 1);

        let new = pf.roll(old, 5.0, contract(3900.0, 5), 2.0, 12.0, t1).unwrap();
        assert!(!pf.get(old).unwrap().is_open());
        assert!(pf.get(new).unwrap().is_open());
        assert_eq!(pf.open_count(), 1);
        assert!(pf.allocation_fraction() <= 0.05);
        assert_eq!(pf.total_premium_paid(), 2_000.0 + 2_400.0);
        assert_eq!(pf.total_proceeds(), 1_000.0);
    }
}
