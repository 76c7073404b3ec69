use crate::config::EngineSettings;
use crate::errors::{HedgeError, HedgeResult};
use crate::models::regime::{RegimeAnalyzer, RegimeContext, RegimeLabel};
use crate::models::{PricingEngine, PricingParams};
use crate::portfolio::{Portfolio, PortfolioSettings, PositionId};
use crate::risk::limits;
use crate::state::{ChainEntry, Greeks, MarketSnapshot, OptionContract, PriceResult, DAYS_PER_YEAR};
use crate::strategy::definition::HedgingStrategyDefinition;
use crate::strategy::selection::{self, select_entry};
use crate::strategy::triggers::{self, ExitTrigger, TriggerInputs, TriggerMetric};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use smallvec::SmallVec;
use std::borrow::Cow;

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION LIFECYCLE
//
// Candidate -> Open -> {NearExpiry} -> {Rolled | PartiallyExited | Exited | Expired}
//
// Phases per snapshot:
//   0. Settle: Rolled -> Open(new), Exited/Expired -> Candidate
//   1. Expiry: a position at 0 DTE is closed at intrinsic value
//   2. Mark: reprice the held contract under the current regime
//   3. Exit triggers: each unfired trigger that holds sells its fraction
//   4. Roll: Open -> NearExpiry at the threshold; roll on the next evaluation,
//      deferred while the term structure is inverted, forced at the hard floor
//   5. Entry: a Candidate selects, sizes and opens a new position
//
// Per-contract and per-position failures become run annotations.
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of the strategy's single hedge slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Candidate,
    Open { position: PositionId },
    PartiallyExited { position: PositionId },
    NearExpiry { position: PositionId, since: DateTime<Utc> },
    Rolled { from: PositionId, to: PositionId },
    Exited { position: PositionId },
    Expired { position: PositionId },
}

/// Inputs to the pure transition function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Enter(PositionId),
    PartialExit,
    FullExit,
    ReachNearExpiry(DateTime<Utc>),
    Roll(PositionId),
    Expire,
    Settle,
}

impl LifecycleState {
    /// Next state, or None if `t` is not valid from here.
    pub fn apply(self, t: Transition) -> Option<LifecycleState> {
        use LifecycleState::*;
        match (self, t) {
            (Candidate, Transition::Enter(position)) => Some(Open { position }),
            (Open { position } | PartiallyExited { position }, Transition::PartialExit) => {
                Some(PartiallyExited { position })
            }
            (NearExpiry { .. }, Transition::PartialExit) => Some(self),
            (
                Open { position } | PartiallyExited { position } | NearExpiry { position, .. },
                Transition::FullExit,
            ) => Some(Exited { position }),
            (Open { position } | PartiallyExited { position }, Transition::ReachNearExpiry(since)) => {
                Some(NearExpiry { position, since })
            }
            (NearExpiry { position, .. }, Transition::Roll(to)) => Some(Rolled { from: position, to }),
            (
                Open { position } | PartiallyExited { position } | NearExpiry { position, .. },
                Transition::Expire,
            ) => Some(Expired { position }),
            (Rolled { to, .. }, Transition::Settle) => Some(Open { position: to }),
            (Exited { .. } | Expired { .. }, Transition::Settle) => Some(Candidate),
            _ => None,
        }
    }

    /// The position this state is tracking, if it is still held.
    pub fn held_position(&self) -> Option<PositionId> {
        match *self {
            Self::Open { position }
            | Self::PartiallyExited { position }
            | Self::NearExpiry { position, .. } => Some(position),
            Self::Rolled { to, .. } => Some(to),
            Self::Candidate | Self::Exited { .. } | Self::Expired { .. } => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rolled { .. } | Self::Exited { .. } | Self::Expired { .. })
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate => write!(f, "candidate"),
            Self::Open { position } => write!(f, "open({position})"),
            Self::PartiallyExited { position } => write!(f, "partially_exited({position})"),
            Self::NearExpiry { position, .. } => write!(f, "near_expiry({position})"),
            Self::Rolled { from, to } => write!(f, "rolled({from}->{to})"),
            Self::Exited { position } => write!(f, "exited({position})"),
            Self::Expired { position } => write!(f, "expired({position})"),
        }
    }
}

// ── Run Records ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Entered {
        position: PositionId,
        strike: f64,
        expiration: NaiveDate,
        quantity: f64,
        price: f64,
    },
    TriggerFired {
        position: PositionId,
        trigger: usize,
        metric: TriggerMetric,
        fraction: f64,
        price: f64,
        pnl: f64,
    },
    Exited {
        position: PositionId,
    },
    NearExpiry {
        position: PositionId,
        dte: i64,
    },
    RollDeferred {
        position: PositionId,
        dte: i64,
        term_slope: f64,
    },
    Rolled {
        from: PositionId,
        to: PositionId,
        strike: f64,
        expiration: NaiveDate,
        quantity: f64,
        price: f64,
        salvage: f64,
    },
    Expired {
        position: PositionId,
        settlement: f64,
        pnl: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// A recoverable failure recorded instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunAnnotation {
    pub timestamp: DateTime<Utc>,
    pub kind: &'static str,
    pub message: String,
}

/// Pricing facts captured when a contract is bought.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryRecord {
    pub timestamp: DateTime<Utc>,
    pub position: PositionId,
    pub strike: f64,
    pub days_to_expiration: i64,
    pub price: f64,
    pub quantity: f64,
    pub premium: f64,
    pub regime: RegimeLabel,
    /// Per-contract Greeks under the strategy's model.
    pub greeks: Option<Greeks>,
    pub jump_risk_premium: Option<f64>,
    /// Per-unit value under the configured instant stress shock.
    pub stressed_price: Option<f64>,
}

/// Portfolio state after each processed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathPoint {
    pub timestamp: DateTime<Utc>,
    pub spot: f64,
    pub vix: f64,
    pub regime: RegimeLabel,
    pub protected_value: f64,
    pub hedge_value: f64,
    pub cash: f64,
    pub total_value: f64,
    /// Cumulative proceeds from trigger exits and expiry settlements.
    pub exit_proceeds: f64,
    /// Hedge value + all proceeds - premiums - fees.
    pub hedge_pnl: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunCounts {
    pub entries: u32,
    pub rolls: u32,
    pub partial_exits: u32,
    pub full_exits: u32,
    pub expiries: u32,
    pub roll_deferrals: u32,
    pub skips: u32,
}

/// Everything a finished run hands to the metrics layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub strategy_id: String,
    pub final_state: LifecycleState,
    pub events: Vec<LifecycleEvent>,
    pub annotations: Vec<RunAnnotation>,
    pub entries: Vec<EntryRecord>,
    pub path: Vec<PathPoint>,
    pub counts: RunCounts,
    pub initial_value: f64,
    pub total_premium_paid: f64,
    pub total_fees: f64,
    pub roll_salvage: f64,
    pub open_positions: usize,
    pub final_greeks: Greeks,
}

/// Shared read-only collaborators for a run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub engine: &'a PricingEngine,
    pub analyzer: &'a RegimeAnalyzer,
    pub settings: &'a EngineSettings,
}

/// Held contract repriced at one snapshot.
#[derive(Debug, Clone, Copy)]
struct Valuation {
    mark: f64,
    exit: f64,
    model: PriceResult,
}

/// Result of evaluating exit triggers against one position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerOutcome {
    /// (trigger index, fraction sold, realized pnl)
    pub fired: SmallVec<[(usize, f64, f64); 4]>,
    pub closed: bool,
}

/// Fire every unfired trigger that holds, selling its fraction of the
/// remaining quantity. A full-exit trigger closes the position and stops
/// further evaluation.
pub fn run_exit_triggers(
    portfolio: &mut Portfolio,
    id: PositionId,
    exit_triggers: &[ExitTrigger],
    inputs: &TriggerInputs,
    exit_price: f64,
    at: DateTime<Utc>,
) -> HedgeResult<TriggerOutcome> {
    let position = portfolio.get(id).ok_or(HedgeError::UnknownPosition(id))?;
    if !position.is_open() {
        return Err(HedgeError::PositionClosed(id));
    }
    let fired = triggers::evaluate(exit_triggers, position, inputs);

    let mut outcome = TriggerOutcome::default();
    for f in fired {
        portfolio.record_trigger(id, f.index)?;
        if f.trigger.is_full_exit() {
            let pnl = portfolio.close(id, exit_price, at)?;
            outcome.fired.push((f.index, 1.0, pnl));
            outcome.closed = true;
            break;
        }
        let pnl = portfolio.reduce(id, f.trigger.action_fraction, exit_price, at)?;
        outcome.fired.push((f.index, f.trigger.action_fraction, pnl));
    }
    Ok(outcome)
}

/// One strategy driven over a snapshot sequence. Owns its portfolio;
/// nothing mutable is shared with other runs.
pub struct StrategyRun<'a> {
    strategy: &'a HedgingStrategyDefinition,
    ctx: RunContext<'a>,
    portfolio: Portfolio,
    state: LifecycleState,
    initial_spot: Option<f64>,
    last_timestamp: Option<DateTime<Utc>>,
    peak_total_value: f64,
    roll_salvage: f64,
    exit_proceeds: f64,
    counts: RunCounts,
    events: Vec<LifecycleEvent>,
    annotations: Vec<RunAnnotation>,
    entries: Vec<EntryRecord>,
    path: Vec<PathPoint>,
}

impl<'a> StrategyRun<'a> {
    pub fn new(strategy: &'a HedgingStrategyDefinition, ctx: RunContext<'a>) -> HedgeResult<Self> {
        strategy.validate()?;
        let settings = ctx.settings;
        let portfolio = Portfolio::new(
            settings.initial_protected_value(),
            settings.initial_cash(),
            PortfolioSettings {
                max_allocation: strategy.max_allocation,
                contract_multiplier: settings.contract_multiplier,
                fee_per_contract: settings.fee_per_contract,
            },
        )?;
        Ok(Self {
            strategy,
            ctx,
            peak_total_value: portfolio.total_value(),
            portfolio,
            state: LifecycleState::Candidate,
            initial_spot: None,
            last_timestamp: None,
            roll_salvage: 0.0,
            exit_proceeds: 0.0,
            counts: RunCounts::default(),
            events: Vec::new(),
            annotations: Vec::new(),
            entries: Vec::new(),
            path: Vec::new(),
        })
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[inline]
    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    #[inline]
    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    #[inline]
    pub fn annotations(&self) -> &[RunAnnotation] {
        &self.annotations
    }

    /// Process one snapshot. Snapshots must arrive in strictly increasing
    /// time order; anything else is annotated and ignored.
    pub fn step(&mut self, snapshot: &MarketSnapshot) {
        let ts = snapshot.timestamp;
        if let Err(e) = snapshot.validate() {
            self.annotate(ts, &e);
            return;
        }
        if self.last_timestamp.is_some_and(|last| ts <= last) {
            self.annotate(ts, &HedgeError::InvalidInput("snapshot out of chronological order".into()));
            return;
        }
        self.last_timestamp = Some(ts);

        let regime = self.ctx.analyzer.classify(snapshot);
        self.revalue_protected(snapshot);

        // ── PHASE 0: Settle ──
        if self.state.is_terminal() {
            self.transition(Transition::Settle);
        }

        // ── PHASE 1: Expiry ──
        self.settle_expiry(snapshot);

        // ── PHASE 2: Mark ──
        let valuation = self.mark_held(snapshot, &regime);
        self.peak_total_value = self.peak_total_value.max(self.portfolio.total_value());

        // ── PHASE 3: Exit Triggers ──
        if let Some(v) = valuation {
            self.apply_triggers(snapshot, &v);
        }

        // ── PHASE 4: Roll ──
        self.evaluate_roll(snapshot, &regime, valuation);

        // ── PHASE 5: Entry ──
        if self.state == LifecycleState::Candidate {
            self.enter(snapshot, &regime);
        }

        self.record_path(snapshot, &regime);
    }

    pub fn run(mut self, snapshots: &[MarketSnapshot]) -> RunOutcome {
        for snapshot in snapshots {
            self.step(snapshot);
        }
        self.finish()
    }

    pub fn finish(self) -> RunOutcome {
        tracing::info!(
            strategy = %self.strategy.id,
            state = %self.state,
            entries = self.counts.entries,
            rolls = self.counts.rolls,
            exits = self.counts.full_exits,
            skips = self.counts.skips,
            "strategy run finished"
        );
        RunOutcome {
            strategy_id: self.strategy.id.clone(),
            final_state: self.state,
            counts: self.counts,
            initial_value: self.ctx.settings.initial_portfolio_value,
            total_premium_paid: self.portfolio.total_premium_paid(),
            total_fees: self.portfolio.total_fees(),
            roll_salvage: self.roll_salvage,
            open_positions: self.portfolio.open_count(),
            final_greeks: self.portfolio.greeks(),
            events: self.events,
            annotations: self.annotations,
            entries: self.entries,
            path: self.path,
        }
    }

    // ── Phases ──

    fn revalue_protected(&mut self, snapshot: &MarketSnapshot) {
        let initial_spot = *self.initial_spot.get_or_insert(snapshot.spot);
        let value = self.ctx.settings.initial_protected_value() * snapshot.spot / initial_spot;
        if let Err(e) = self.portfolio.revalue_protected_asset(value) {
            self.annotate(snapshot.timestamp, &e);
        }
    }

    fn settle_expiry(&mut self, snapshot: &MarketSnapshot) {
        let Some(id) = self.state.held_position() else { return };
        let Some(position) = self.portfolio.get(id) else { return };
        if position.contract.days_to_expiration(snapshot.date()) > 0 {
            return;
        }
        let settlement = position.contract.intrinsic(snapshot.spot);
        let proceeds = settlement * position.quantity * position.multiplier;
        match self.portfolio.close(id, settlement, snapshot.timestamp) {
            Ok(pnl) => {
                self.exit_proceeds += proceeds;
                self.counts.expiries += 1;
                self.transition(Transition::Expire);
                self.push_event(snapshot.timestamp, EventKind::Expired { position: id, settlement, pnl });
                tracing::info!(strategy = %self.strategy.id, position = %id, settlement = settlement, pnl = pnl, "hedge expired");
            }
            Err(e) => self.annotate(snapshot.timestamp, &e),
        }
    }

    fn mark_held(&mut self, snapshot: &MarketSnapshot, regime: &RegimeContext) -> Option<Valuation> {
        let id = self.state.held_position()?;
        let contract = self.portfolio.get(id)?.contract.clone();
        let valuation = match self.value_contract(&contract, snapshot, regime) {
            Ok(v) => v,
            Err(e) => {
                self.annotate(snapshot.timestamp, &e);
                return None;
            }
        };
        if let Err(e) = self.portfolio.mark(id, valuation.mark, valuation.model.greeks, snapshot.timestamp) {
            self.annotate(snapshot.timestamp, &e);
            return None;
        }
        Some(valuation)
    }

    fn apply_triggers(&mut self, snapshot: &MarketSnapshot, valuation: &Valuation) {
        if self.strategy.exit_triggers.is_empty() {
            return;
        }
        let Some(id) = self.state.held_position() else { return };
        let Some(position) = self.portfolio.get(id) else { return };
        let inputs = TriggerInputs {
            unrealized_multiple: position.unrealized_multiple(),
            vix: snapshot.vix,
            portfolio_drawdown: self.current_drawdown(),
            days_held: position.days_held(snapshot.timestamp),
            days_to_expiration: position.contract.days_to_expiration(snapshot.date()),
        };
        let sold_qty = position.quantity;

        let outcome = match run_exit_triggers(
            &mut self.portfolio,
            id,
            &self.strategy.exit_triggers,
            &inputs,
            valuation.exit,
            snapshot.timestamp,
        ) {
            Ok(o) => o,
            Err(e) => {
                self.annotate(snapshot.timestamp, &e);
                return;
            }
        };

        let multiplier = self.ctx.settings.contract_multiplier;
        let mut remaining = sold_qty;
        for &(index, fraction, pnl) in &outcome.fired {
            let sold = remaining * fraction;
            remaining -= sold;
            self.exit_proceeds += valuation.exit * sold * multiplier;
            let metric = self.strategy.exit_triggers[index].metric;
            self.push_event(
                snapshot.timestamp,
                EventKind::TriggerFired { position: id, trigger: index, metric, fraction, price: valuation.exit, pnl },
            );
            tracing::info!(
                strategy = %self.strategy.id,
                position = %id,
                metric = %metric,
                fraction = fraction,
                pnl = pnl,
                "exit trigger fired"
            );
        }

        if outcome.closed {
            self.counts.full_exits += 1;
            self.transition(Transition::FullExit);
            self.push_event(snapshot.timestamp, EventKind::Exited { position: id });
        } else if !outcome.fired.is_empty() {
            self.counts.partial_exits += outcome.fired.len() as u32;
            self.transition(Transition::PartialExit);
        }
    }

    fn evaluate_roll(&mut self, snapshot: &MarketSnapshot, regime: &RegimeContext, valuation: Option<Valuation>) {
        let ts = snapshot.timestamp;
        let Some(id) = self.state.held_position() else { return };
        let Some(position) = self.portfolio.get(id).filter(|p| p.is_open()) else { return };
        let dte = position.contract.days_to_expiration(snapshot.date());
        let floor = i64::from(self.strategy.hard_roll_floor_days);

        match self.state {
            LifecycleState::Open { .. } | LifecycleState::PartiallyExited { .. } => {
                if dte > i64::from(self.strategy.rolling_threshold_days) {
                    return;
                }
                self.transition(Transition::ReachNearExpiry(ts));
                self.push_event(ts, EventKind::NearExpiry { position: id, dte });
                // Roll on the next evaluation unless already at the floor.
                if dte > floor {
                    return;
                }
            }
            LifecycleState::NearExpiry { since, .. } => {
                let waited = (ts.date_naive() - since.date_naive()).num_days();
                if regime.is_inverted() && dte > floor && waited < i64::from(self.strategy.roll_grace_days) {
                    self.counts.roll_deferrals += 1;
                    self.push_event(
                        ts,
                        EventKind::RollDeferred { position: id, dte, term_slope: regime.term_structure_slope },
                    );
                    tracing::debug!(strategy = %self.strategy.id, position = %id, dte = dte, "roll deferred, inverted term structure");
                    return;
                }
            }
            _ => return,
        }

        let Some(valuation) = valuation else {
            self.annotate(ts, &HedgeError::NumericalInstability(format!("cannot value {id} for roll")));
            return;
        };
        self.roll(snapshot, regime, id, valuation.exit);
    }

    fn roll(&mut self, snapshot: &MarketSnapshot, regime: &RegimeContext, old: PositionId, exit_price: f64) {
        let ts = snapshot.timestamp;
        let held = match self.portfolio.get(old) {
            Some(p) => p.contract.clone(),
            None => return,
        };
        let chain = self.chain_for(snapshot, regime);
        let entry = match select_entry(&chain, snapshot.date(), snapshot.spot, self.strategy, Some(&held)) {
            Ok(e) => e.clone(),
            Err(e) => {
                self.annotate(ts, &e);
                return;
            }
        };
        let (contract, price) = match contract_and_fill(snapshot, &entry) {
            Ok(x) => x,
            Err(e) => {
                self.annotate(ts, &e);
                return;
            }
        };

        let after_sale = match self.portfolio.allocation_state_after_exit(old, exit_price) {
            Ok(s) => s,
            Err(e) => {
                self.annotate(ts, &e);
                return;
            }
        };
        let quantity = self.size(&after_sale, regime, price);
        if quantity < 1.0 {
            self.annotate(ts, &HedgeError::StrategySkipped("roll budget below one contract".into()));
            return;
        }
        let old_qty = self.portfolio.get(old).map_or(0.0, |p| p.quantity);

        match self.portfolio.roll(old, exit_price, contract.clone(), quantity, price, ts) {
            Ok(new_id) => {
                let salvage = exit_price * old_qty * self.ctx.settings.contract_multiplier;
                self.roll_salvage += salvage;
                self.counts.rolls += 1;
                self.transition(Transition::Roll(new_id));
                self.push_event(
                    ts,
                    EventKind::Rolled {
                        from: old,
                        to: new_id,
                        strike: contract.strike(),
                        expiration: contract.expiration(),
                        quantity,
                        price,
                        salvage,
                    },
                );
                self.after_open(snapshot, regime, new_id, &contract, quantity, price);
            }
            Err(e) => self.annotate(ts, &e),
        }
    }

    fn enter(&mut self, snapshot: &MarketSnapshot, regime: &RegimeContext) {
        let ts = snapshot.timestamp;
        let chain = self.chain_for(snapshot, regime);
        let entry = match select_entry(&chain, snapshot.date(), snapshot.spot, self.strategy, None) {
            Ok(e) => e.clone(),
            Err(e) => {
                self.annotate(ts, &e);
                return;
            }
        };
        let (contract, price) = match contract_and_fill(snapshot, &entry) {
            Ok(x) => x,
            Err(e) => {
                self.annotate(ts, &e);
                return;
            }
        };
        let quantity = self.size(&self.portfolio.allocation_state(), regime, price);
        if quantity < 1.0 {
            self.annotate(ts, &HedgeError::StrategySkipped("entry budget below one contract".into()));
            return;
        }

        match self.portfolio.open(contract.clone(), quantity, price, ts) {
            Ok(id) => {
                self.transition(Transition::Enter(id));
                self.push_event(
                    ts,
                    EventKind::Entered {
                        position: id,
                        strike: contract.strike(),
                        expiration: contract.expiration(),
                        quantity,
                        price,
                    },
                );
                self.after_open(snapshot, regime, id, &contract, quantity, price);
            }
            Err(e) => self.annotate(ts, &e),
        }
    }

    /// Capture entry analytics and put an initial mark on the new position.
    fn after_open(
        &mut self,
        snapshot: &MarketSnapshot,
        regime: &RegimeContext,
        id: PositionId,
        contract: &OptionContract,
        quantity: f64,
        price: f64,
    ) {
        let ts = snapshot.timestamp;
        self.counts.entries += 1;
        let params = self.params_for(contract, snapshot);

        let valuation = self.value_contract(contract, snapshot, regime);
        let greeks = match &valuation {
            Ok(v) => {
                if let Err(e) = self.portfolio.mark(id, v.mark, v.model.greeks, ts) {
                    self.annotate(ts, &e);
                }
                Some(v.model.greeks)
            }
            Err(e) => {
                self.annotate(ts, e);
                None
            }
        };
        let jump_risk_premium = match self.ctx.engine.jump_risk_premium(&params, Some(regime)) {
            Ok(j) => Some(j),
            Err(e) => {
                self.annotate(ts, &e);
                None
            }
        };
        let stressed_price = match self.stressed_price(&params) {
            Ok(p) => Some(p),
            Err(e) => {
                self.annotate(ts, &e);
                None
            }
        };

        self.entries.push(EntryRecord {
            timestamp: ts,
            position: id,
            strike: contract.strike(),
            days_to_expiration: contract.days_to_expiration(snapshot.date()),
            price,
            quantity,
            premium: price * quantity * self.ctx.settings.contract_multiplier,
            regime: regime.label,
            greeks,
            jump_risk_premium,
            stressed_price,
        });
    }

    fn record_path(&mut self, snapshot: &MarketSnapshot, regime: &RegimeContext) {
        let hedge_value = self.portfolio.hedge_value();
        let hedge_pnl = hedge_value + self.portfolio.total_proceeds()
            - self.portfolio.total_premium_paid()
            - self.portfolio.total_fees();
        self.path.push(PathPoint {
            timestamp: snapshot.timestamp,
            spot: snapshot.spot,
            vix: snapshot.vix,
            regime: regime.label,
            protected_value: self.portfolio.protected_value(),
            hedge_value,
            cash: self.portfolio.cash(),
            total_value: self.portfolio.total_value(),
            exit_proceeds: self.exit_proceeds,
            hedge_pnl,
        });
    }

    // ── Helpers ──

    fn transition(&mut self, t: Transition) {
        match self.state.apply(t) {
            Some(next) => self.state = next,
            None => tracing::error!(
                strategy = %self.strategy.id,
                state = %self.state,
                transition = ?t,
                "invalid lifecycle transition ignored"
            ),
        }
    }

    fn push_event(&mut self, timestamp: DateTime<Utc>, kind: EventKind) {
        self.events.push(LifecycleEvent { timestamp, kind });
    }

    fn annotate(&mut self, timestamp: DateTime<Utc>, err: &HedgeError) {
        match err {
            HedgeError::StrategySkipped(_) => {
                self.counts.skips += 1;
                tracing::warn!(strategy = %self.strategy.id, "period skipped: {err}");
            }
            HedgeError::PositionClosed(_) | HedgeError::UnknownPosition(_) => {
                tracing::error!(strategy = %self.strategy.id, "lifecycle defect: {err}");
            }
            _ => tracing::warn!(strategy = %self.strategy.id, kind = err.kind(), "{err}"),
        }
        self.annotations.push(RunAnnotation {
            timestamp,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn current_drawdown(&self) -> f64 {
        if self.peak_total_value <= 0.0 {
            return 0.0;
        }
        (1.0 - self.portfolio.total_value() / self.peak_total_value).max(0.0)
    }

    fn chain_for<'s>(&self, snapshot: &'s MarketSnapshot, regime: &RegimeContext) -> Cow<'s, [ChainEntry]> {
        if snapshot.chain.is_empty() {
            Cow::Owned(selection::synthesize_chain(
                snapshot,
                self.strategy,
                self.ctx.engine,
                regime,
                &self.ctx.settings.synthesis,
            ))
        } else {
            Cow::Borrowed(&snapshot.chain)
        }
    }

    fn allocation_multiplier(&self, regime: &RegimeContext) -> f64 {
        match &self.strategy.regime_allocation_overrides {
            Some(mults) => mults[regime.label.index()],
            None => regime.allocation_multiplier,
        }
    }

    fn size(&self, state: &limits::AllocationState, regime: &RegimeContext, price: f64) -> f64 {
        let budget = limits::hedge_budget(
            self.strategy.allocation_fraction,
            self.allocation_multiplier(regime),
            self.strategy.max_allocation,
            state.total_value,
        );
        limits::size_contracts(
            state,
            budget,
            price,
            self.ctx.settings.contract_multiplier,
            self.ctx.settings.fee_per_contract,
        )
    }

    fn params_for(&self, contract: &OptionContract, snapshot: &MarketSnapshot) -> PricingParams {
        let dte = contract.days_to_expiration(snapshot.date()).max(0);
        let sigma = snapshot.implied_vol(dte as f64, contract.strike() / snapshot.spot);
        PricingParams::new(
            snapshot.spot,
            contract.strike(),
            dte as f64 / DAYS_PER_YEAR,
            snapshot.risk_free_rate,
            sigma,
            contract.option_type(),
        )
        .with_dividend_yield(snapshot.dividend_yield)
    }

    /// Mark at the quoted mid when the series is listed with a bid, else at
    /// the model price. Exits fill at the bid, or model less the synthetic half spread.
    fn value_contract(
        &self,
        contract: &OptionContract,
        snapshot: &MarketSnapshot,
        regime: &RegimeContext,
    ) -> HedgeResult<Valuation> {
        let params = self.params_for(contract, snapshot);
        let model = self.ctx.engine.price(self.strategy.pricing_model, &params, Some(regime))?;
        let quote = snapshot.chain.iter().find(|e| {
            e.option_type == contract.option_type()
                && e.strike == contract.strike()
                && e.expiration == contract.expiration()
                && e.bid > 0.0
        });
        Ok(match quote {
            Some(q) => Valuation {
                mark: q.quote().mid(),
                exit: q.bid,
                model,
            },
            None => Valuation {
                mark: model.price,
                exit: model.price * (1.0 - self.ctx.settings.synthesis.half_spread),
                model,
            },
        })
    }

    fn stressed_price(&self, params: &PricingParams) -> HedgeResult<f64> {
        let shock = &self.ctx.settings.stress_shock;
        let shocked = PricingParams {
            spot: params.spot * (1.0 + shock.spot_move),
            sigma: params.sigma.max(shock.vix / 100.0),
            ..*params
        };
        let label = self.ctx.analyzer.classify_vix(shock.vix);
        let regime = self.ctx.analyzer.context_for(label, shock.vix, None);
        Ok(self.ctx.engine.price(self.strategy.pricing_model, &shocked, Some(&regime))?.price)
    }
}

/// Contract identity plus the fill price for a buy: the ask, or the mid
/// when no ask is quoted.
fn contract_and_fill(snapshot: &MarketSnapshot, entry: &ChainEntry) -> HedgeResult<(OptionContract, f64)> {
    let contract = OptionContract::from_chain_entry(snapshot.underlying.clone(), entry)?;
    let price = if entry.ask > 0.0 { entry.ask } else { entry.quote().mid() };
    if price <= 0.0 {
        return Err(HedgeError::StrategySkipped(format!("no fill price for {contract}")));
    }
    Ok((contract, price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::regime::RegimeConfig;
    use crate::models::{JumpParams, ModelKind};
    use crate::state::OptionType;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        engine: PricingEngine,
        analyzer: RegimeAnalyzer,
        settings: EngineSettings,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                engine: PricingEngine::new(JumpParams::default()).unwrap(),
                analyzer: RegimeAnalyzer::new(RegimeConfig::default()).unwrap(),
                settings: EngineSettings::default(),
            }
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext { engine: &self.engine, analyzer: &self.analyzer, settings: &self.settings }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 16, 0, 0).unwrap()
    }

    fn listed(strike: f64, expiration: NaiveDate, bid: f64, ask: f64) -> ChainEntry {
        ChainEntry {
            strike,
            expiration,
            option_type: OptionType::Put,
            bid,
            ask,
            last: bid,
            volume: 50,
            open_interest: 500,
        }
    }

    fn snapshot_at(day: i64, spot: f64, vix: f64) -> MarketSnapshot {
        MarketSnapshot::new(t0() + Duration::days(day), "SPX", spot, 0.05, vix)
    }

    #[test]
    fn test_transitions() {
        let id = PositionId(1);
        let s = LifecycleState::Candidate.apply(Transition::Enter(id)).unwrap();
        assert_eq!(s, LifecycleState::Open { position: id });
        let s = s.apply(Transition::PartialExit).unwrap();
        assert_eq!(s, LifecycleState::PartiallyExited { position: id });
        let s = s.apply(Transition::ReachNearExpiry(t0())).unwrap();
        assert!(matches!(s, LifecycleState::NearExpiry { .. }));
        let s = s.apply(Transition::Roll(PositionId(2))).unwrap();
        assert_eq!(s, LifecycleState::Rolled { from: id, to: PositionId(2) });
        assert!(s.is_terminal());
        let s = s.apply(Transition::Settle).unwrap();
        assert_eq!(s, LifecycleState::Open { position: PositionId(2) });
        let s = s.apply(Transition::FullExit).unwrap();
        assert_eq!(s.apply(Transition::Settle), Some(LifecycleState::Candidate));

        assert_eq!(LifecycleState::Candidate.apply(Transition::Roll(id)), None);
        assert_eq!(LifecycleState::Open { position: id }.apply(Transition::Roll(id)), None);
        assert_eq!(LifecycleState::Candidate.apply(Transition::Expire), None);
    }

    #[test]
    fn test_exit_trigger_fires_once() {
        let mut pf = Portfolio::new(
            90_000.0,
            10_000.0,
            PortfolioSettings { max_allocation: 0.05, contract_multiplier: 100.0, fee_per_contract: 0.0 },
        )
        .unwrap();
        let contract = OptionContract::new(
            "SPX",
            3800.0,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionType::Put,
            None,
        )
        .unwrap();
        let id = pf.open(contract, 1.0, 1.0, t0()).unwrap();
        assert_eq!(pf.get(id).unwrap().premium_paid, 100.0);

        let trig = vec![ExitTrigger::at_least(TriggerMetric::UnrealizedMultiple, 5.0, 0.5)];
        let inputs = |m: f64| TriggerInputs {
            unrealized_multiple: m,
            vix: 20.0,
            portfolio_drawdown: 0.0,
            days_held: 1,
            days_to_expiration: 60,
        };

        let t1 = t0() + Duration::days(1);
        pf.mark(id, 6.0, Greeks::default(), t1).unwrap();
        let value = pf.get(id).unwrap().market_value();
        assert_eq!(value, 600.0);
        let observed = inputs(pf.get(id).unwrap().unrealized_multiple());
        let out = run_exit_triggers(&mut pf, id, &trig, &observed, 6.0, t1).unwrap();
        assert_eq!(out.fired.len(), 1);
        assert!(!out.closed);
        assert_eq!(pf.get(id).unwrap().quantity, 0.5, "half the notional liquidated");

        let t2 = t1 + Duration::days(1);
        pf.mark(id, 7.0, Greeks::default(), t2).unwrap();
        let observed = inputs(pf.get(id).unwrap().unrealized_multiple());
        let out = run_exit_triggers(&mut pf, id, &trig, &observed, 7.0, t2).unwrap();
        assert!(out.fired.is_empty(), "trigger must not fire again");
        assert_eq!(pf.get(id).unwrap().quantity, 0.5);
        assert_eq!(pf.get(id).unwrap().fired_triggers.len(), 1);
    }

    #[test]
    fn test_full_exit_trigger_closes() {
        let mut pf = Portfolio::new(
            90_000.0,
            10_000.0,
            PortfolioSettings { max_allocation: 0.05, contract_multiplier: 100.0, fee_per_contract: 1.0 },
        )
        .unwrap();
        let contract = OptionContract::new("SPX", 3800.0, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(), OptionType::Put, None).unwrap();
        let id = pf.open(contract, 2.0, 1.0, t0()).unwrap();
        let trig = vec![
            ExitTrigger::at_least(TriggerMetric::Vix, 40.0, 1.0),
            ExitTrigger::at_least(TriggerMetric::Vix, 30.0, 0.5),
        ];
        let inputs = TriggerInputs { unrealized_multiple: 1.0, vix: 50.0, portfolio_drawdown: 0.0, days_held: 0, days_to_expiration: 60 };
        let out = run_exit_triggers(&mut pf, id, &trig, &inputs, 3.0, t0()).unwrap();
        assert!(out.closed);
        assert_eq!(out.fired.len(), 1, "evaluation stops after a full exit");
        assert!(!pf.get(id).unwrap().is_open());
    }

    #[test]
    fn test_basic_roll() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("roll", 0.15, 40, 50);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();

        let day0 = t0().date_naive();
        let first_expiry = day0 + Duration::days(45);
        let second_expiry = day0 + Duration::days(70);
        let chain = vec![
            listed(3825.0, first_expiry, 10.0, 10.5),
            listed(3825.0, second_expiry, 15.0, 15.5),
        ];

        // Day 0 at 45 DTE through day 25 at 20 DTE.
        for day in 0..=25 {
            let snap = snapshot_at(day, 4500.0, 14.0).with_chain(chain.clone());
            run.step(&snap);
            if day == 0 {
                assert!(matches!(run.state(), LifecycleState::Open { .. }), "state={}", run.state());
            }
        }

        let rolls: Vec<_> = run
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Rolled { .. }))
            .collect();
        assert_eq!(rolls.len(), 1, "exactly one roll, events={:?}", run.events());
        assert_eq!(run.portfolio().open_count(), 1);
        let open = run.portfolio().open_positions().next().unwrap();
        assert_eq!(open.contract.expiration(), second_expiry);
        assert_eq!(rolls[0].timestamp, t0() + Duration::days(25), "roll one step after reaching 21 DTE");
    }

    #[test]
    fn test_roll_deferred_when_inverted_then_forced_at_floor() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("defer", 0.15, 40, 80).with_roll_policy(10, 5);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();

        let day0 = t0().date_naive();
        let chain = vec![
            listed(3825.0, day0 + Duration::days(45), 10.0, 10.5),
            listed(3825.0, day0 + Duration::days(100), 30.0, 31.0),
        ];
        run.step(&snapshot_at(0, 4500.0, 14.0).with_chain(chain.clone()));
        assert_eq!(run.portfolio().open_count(), 1);

        // VIX 50 -> crisis regime, inverted by default.
        for day in 1..=40 {
            run.step(&snapshot_at(day, 4500.0, 50.0).with_chain(chain.clone()));
        }
        let deferrals = run
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::RollDeferred { .. }))
            .count();
        assert!(deferrals > 0, "inverted term structure should defer the roll");
        let roll = run
            .events()
            .iter()
            .find(|e| matches!(e.kind, EventKind::Rolled { .. }))
            .expect("roll must eventually happen");
        let roll_day = (roll.timestamp - t0()).num_days();
        // NearExpiry at day 24 (21 DTE); grace of 10 days ends at day 34 (11 DTE > floor).
        assert_eq!(roll_day, 34, "roll day {roll_day}");
        assert_eq!(run.portfolio().open_count(), 1);
    }

    #[test]
    fn test_hard_floor_forces_roll_without_grace() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("floor", 0.15, 40, 80).with_roll_policy(30, 5);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();
        let day0 = t0().date_naive();
        let chain = vec![
            listed(3825.0, day0 + Duration::days(45), 10.0, 10.5),
            listed(3825.0, day0 + Duration::days(100), 30.0, 31.0),
        ];
        run.step(&snapshot_at(0, 4500.0, 14.0).with_chain(chain.clone()));
        for day in 1..=42 {
            run.step(&snapshot_at(day, 4500.0, 50.0).with_chain(chain.clone()));
        }
        let roll = run
            .events()
            .iter()
            .find(|e| matches!(e.kind, EventKind::Rolled { .. }))
            .expect("hard floor must force the roll");
        assert_eq!((roll.timestamp - t0()).num_days(), 40, "45 - 40 = 5 DTE is the floor");
    }

    #[test]
    fn test_illiquid_entry_is_skipped_not_fatal() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("skip", 0.15, 40, 50);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();
        let expiry = t0().date_naive() + Duration::days(45);
        let dead = ChainEntry { volume: 0, open_interest: 0, ..listed(3825.0, expiry, 0.0, 1.0) };

        run.step(&snapshot_at(0, 4500.0, 14.0).with_chain(vec![dead]));
        assert_eq!(run.state(), LifecycleState::Candidate);
        assert_eq!(run.annotations().len(), 1);
        assert_eq!(run.annotations()[0].kind, "strategy_skipped");

        run.step(&snapshot_at(1, 4500.0, 14.0).with_chain(vec![listed(3825.0, expiry, 10.0, 10.5)]));
        assert!(matches!(run.state(), LifecycleState::Open { .. }));
    }

    #[test]
    fn test_out_of_order_snapshot_ignored() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("order", 0.15, 40, 50);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();
        run.step(&snapshot_at(5, 4500.0, 14.0));
        let path_len = run.path.len();
        run.step(&snapshot_at(3, 4000.0, 30.0));
        assert_eq!(run.path.len(), path_len, "earlier snapshot must not be processed");
        assert_eq!(run.annotations().last().map(|a| a.kind), Some("invalid_input"));
    }

    #[test]
    fn test_expiry_settles_at_intrinsic() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::new("expire", 0.15, 10, 12)
            .with_rolling_threshold(2)
            .with_roll_policy(60, 0)
            .with_model(ModelKind::BlackScholes);
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();
        let expiry = t0().date_naive() + Duration::days(10);
        let chain = vec![listed(3825.0, expiry, 5.0, 5.5)];

        run.step(&snapshot_at(0, 4500.0, 14.0).with_chain(chain.clone()));
        assert!(matches!(run.state(), LifecycleState::Open { .. }));
        // Crash and stay inverted so the roll keeps being deferred until expiry.
        for day in 1..=10 {
            run.step(&snapshot_at(day, 3500.0, 60.0).with_chain(chain.clone()));
        }
        let expired = run
            .events()
            .iter()
            .find_map(|e| match e.kind {
                EventKind::Expired { settlement, .. } => Some(settlement),
                _ => None,
            })
            .expect("position should expire");
        assert_eq!(expired, 325.0);
    }

    #[test]
    fn test_synthesized_entry_records_analytics() {
        let fx = Fixture::new();
        let strategy = HedgingStrategyDefinition::two_month_15pct_otm();
        let mut run = StrategyRun::new(&strategy, fx.ctx()).unwrap();
        run.step(&snapshot_at(0, 4700.0, 16.0));
        let outcome = run.finish();
        assert_eq!(outcome.entries.len(), 1, "annotations={:?}", outcome.annotations);
        let e = &outcome.entries[0];
        assert!(e.jump_risk_premium.is_some_and(|j| j > 0.0));
        assert!(e.greeks.is_some_and(|g| g.delta < 0.0 && g.vega > 0.0));
        assert!(e.stressed_price.is_some_and(|p| p > e.price));
        assert!(e.premium <= 0.05 * 100_000.0);
    }
}
