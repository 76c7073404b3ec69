use crate::state::{Greeks, OptionContract};
use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;

/// Portfolio-scoped position handle. Issued sequentially, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One option holding. The contract is fixed for the life of the position;
/// only the mark, quantity and P&L change.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: PositionId,
    pub contract: OptionContract,
    pub quantity: f64,
    pub initial_quantity: f64,
    /// Per-unit premium paid at entry.
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// entry_price * initial_quantity * multiplier
    pub premium_paid: f64,
    pub multiplier: f64,
    pub current_price: f64,
    /// Per-contract Greeks from the latest mark.
    pub greeks: Greeks,
    /// None until the first mark.
    pub last_marked_at: Option<DateTime<Utc>>,
    pub peak_value: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub closed_at: Option<DateTime<Utc>>,
    /// Indices into the strategy's trigger list. Append-only.
    pub fired_triggers: SmallVec<[usize; 4]>,
}

impl Position {
    pub(crate) fn new(
        id: PositionId,
        contract: OptionContract,
        quantity: f64,
        entry_price: f64,
        multiplier: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let premium_paid = entry_price * quantity * multiplier;
        Self {
            id,
            contract,
            quantity,
            initial_quantity: quantity,
            entry_price,
            entry_time,
            premium_paid,
            multiplier,
            current_price: entry_price,
            greeks: Greeks::default(),
            last_marked_at: None,
            peak_value: premium_paid,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            closed_at: None,
            fired_triggers: SmallVec::new(),
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Current market value of the remaining quantity.
    #[inline]
    pub fn market_value(&self) -> f64 {
        self.current_price * self.quantity * self.multiplier
    }

    /// Current value relative to entry premium, per unit.
    #[inline]
    pub fn unrealized_multiple(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.current_price / self.entry_price
    }

    #[inline]
    pub fn unrealized_pnl(&self) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        (self.current_price - self.entry_price) * self.quantity * self.multiplier
    }

    /// Position-level Greeks: per-contract Greeks times quantity and multiplier.
    #[inline]
    pub fn position_greeks(&self) -> Greeks {
        self.greeks.scale(self.quantity * self.multiplier)
    }

    #[inline]
    pub fn days_held(&self, as_of: DateTime<Utc>) -> i64 {
        (as_of.date_naive() - self.entry_time.date_naive()).num_days()
    }

    #[inline]
    pub fn has_fired(&self, trigger: usize) -> bool {
        self.fired_triggers.contains(&trigger)
    }

    /// Record a fired trigger. Returns false if it had already fired.
    pub fn mark_fired(&mut self, trigger: usize) -> bool {
        if self.has_fired(trigger) {
            return false;
        }
        self.fired_triggers.push(trigger);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OptionType;
    use chrono::{NaiveDate, TimeZone};

    fn position() -> Position {
        let contract = OptionContract::new(
            "SPX",
            3800.0,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionType::Put,
            None,
        )
        .unwrap();
        Position::new(
            PositionId(1),
            contract,
            2.0,
            5.0,
            100.0,
            Utc.with_ymd_and_hms(2024, 1, 30, 16, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_premium_and_multiple() {
        let mut p = position();
        assert_eq!(p.premium_paid, 1_000.0);
        assert_eq!(p.market_value(), 1_000.0);
        p.current_price = 25.0;
        assert_eq!(p.unrealized_multiple(), 5.0);
        assert_eq!(p.unrealized_pnl(), 4_000.0);
    }

    #[test]
    fn test_fired_triggers_are_monotonic() {
        let mut p = position();
        assert!(p.mark_fired(0));
        assert!(!p.mark_fired(0));
        assert!(p.mark_fired(2));
        assert!(p.has_fired(0) && p.has_fired(2) && !p.has_fired(1));
        assert_eq!(p.fired_triggers.len(), 2);
    }

    #[test]
    fn test_days_held() {
        let p = position();
        let later = Utc.with_ymd_and_hms(2024, 2, 9, 16, 0, 0).unwrap();
        assert_eq!(p.days_held(later), 10);
    }
}
