use crate::analysis::metrics::{self, RunMetrics};
use crate::analysis::ranking::{rank_results, CompositeScore, RankingPolicy};
use crate::config::EngineSettings;
use crate::errors::{HedgeError, HedgeResult};
use crate::models::regime::{RegimeAnalyzer, RegimeConfig};
use crate::models::{JumpParams, PricingEngine};
use crate::state::{Greeks, HistoricalScenario, MarketSnapshot};
use crate::strategy::definition::HedgingStrategyDefinition;
use crate::strategy::lifecycle::{
    LifecycleEvent, LifecycleState, RunAnnotation, RunContext, RunCounts, RunOutcome, StrategyRun,
};
use chrono::{DateTime, Utc};
use portable_atomic::{AtomicBool, Ordering};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// One point of a strategy's P&L path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PnlPoint {
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub hedge_pnl: f64,
}

/// Per-strategy aggregate. Serialized verbatim by downstream reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub strategy_id: String,
    pub annual_cost: f64,
    pub cost_percentage: f64,
    pub protection_ratio: f64,
    pub jump_risk_premium: f64,
    pub greeks: Greeks,
    pub rank: usize,
    /// Policy score. None when the policy produced a non-finite value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pnl_path: Vec<PnlPoint>,
}

impl ComparisonResult {
    fn from_run(outcome: &RunOutcome, m: RunMetrics) -> Self {
        Self {
            strategy_id: outcome.strategy_id.clone(),
            annual_cost: m.annual_cost,
            cost_percentage: m.cost_percentage,
            protection_ratio: m.protection_ratio,
            jump_risk_premium: m.jump_risk_premium,
            greeks: m.greeks,
            rank: 0,
            score: None,
            total_return: m.total_return,
            max_drawdown: m.max_drawdown,
            sharpe: m.sharpe,
            pnl_path: outcome
                .path
                .iter()
                .map(|p| PnlPoint { timestamp: p.timestamp, total_value: p.total_value, hedge_pnl: p.hedge_pnl })
                .collect(),
        }
    }
}

/// Lifecycle record of one run, kept alongside its result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyRunReport {
    pub strategy_id: String,
    pub final_state: LifecycleState,
    pub counts: RunCounts,
    pub open_positions: usize,
    pub final_greeks: Greeks,
    pub events: Vec<LifecycleEvent>,
    pub annotations: Vec<RunAnnotation>,
}

impl From<RunOutcome> for StrategyRunReport {
    fn from(o: RunOutcome) -> Self {
        Self {
            strategy_id: o.strategy_id,
            final_state: o.final_state,
            counts: o.counts,
            open_positions: o.open_positions,
            final_greeks: o.final_greeks,
            events: o.events,
            annotations: o.annotations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    PointInTime,
    Scenario,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub scenario_name: String,
    /// SHA-256 of the replayed snapshots.
    pub digest: String,
    pub mode: AnalysisMode,
    pub policy: &'static str,
    pub results: Vec<ComparisonResult>,
    pub runs: Vec<StrategyRunReport>,
    pub cancelled: bool,
    /// Strategies never started because the comparison was cancelled.
    pub skipped_strategies: Vec<String>,
}

impl ComparisonReport {
    /// Re-score and re-sort the existing results under another policy.
    pub fn rerank(&mut self, policy: &dyn RankingPolicy) {
        rank_results(&mut self.results, policy);
        self.policy = policy.name();
    }

    pub fn best(&self) -> Option<&ComparisonResult> {
        self.results.first()
    }
}

/// Cooperative cancellation, checked before each strategy run starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs every strategy independently over the same read-only inputs and
/// ranks the results. Each run owns its portfolio; only the pricing engine,
/// regime analyzer and settings are shared.
pub struct ComparisonEngine {
    engine: PricingEngine,
    analyzer: RegimeAnalyzer,
    settings: EngineSettings,
    mode: ExecutionMode,
    policy: Box<dyn RankingPolicy>,
}

impl ComparisonEngine {
    pub fn new(settings: EngineSettings, regime: RegimeConfig, jump: JumpParams) -> HedgeResult<Self> {
        settings.validate()?;
        Ok(Self {
            engine: PricingEngine::new(jump)?,
            analyzer: RegimeAnalyzer::new(regime)?,
            settings,
            mode: ExecutionMode::default(),
            policy: Box::new(CompositeScore::default()),
        })
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: impl RankingPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Enter every strategy against one snapshot and score the entries
    /// under the configured stress shock.
    pub fn compare_point_in_time(
        &self,
        strategies: &[HedgingStrategyDefinition],
        snapshot: &MarketSnapshot,
        cancel: &CancellationFlag,
    ) -> HedgeResult<ComparisonReport> {
        validate_strategies(strategies)?;
        snapshot.validate()?;
        let name = format!("{} @ {}", snapshot.underlying, snapshot.timestamp.format("%Y-%m-%d"));
        let scenario = HistoricalScenario::new(name, vec![snapshot.clone()])?;

        self.compare(strategies, &scenario, cancel, AnalysisMode::PointInTime, |outcome, strategy| {
            metrics::point_in_time_metrics(outcome, strategy.rolling_threshold_days)
        })
    }

    /// Replay a scenario through each strategy's full lifecycle.
    pub fn compare_scenario(
        &self,
        strategies: &[HedgingStrategyDefinition],
        scenario: &HistoricalScenario,
        cancel: &CancellationFlag,
    ) -> HedgeResult<ComparisonReport> {
        validate_strategies(strategies)?;
        let span = scenario.span_days();
        self.compare(strategies, scenario, cancel, AnalysisMode::Scenario, |outcome, _| {
            metrics::scenario_metrics(outcome, span)
        })
    }

    fn compare<F>(
        &self,
        strategies: &[HedgingStrategyDefinition],
        scenario: &HistoricalScenario,
        cancel: &CancellationFlag,
        mode: AnalysisMode,
        measure: F,
    ) -> HedgeResult<ComparisonReport>
    where
        F: Fn(&RunOutcome, &HedgingStrategyDefinition) -> RunMetrics,
    {
        let digest = scenario.digest();
        tracing::info!(
            scenario = %scenario.name,
            digest = %digest,
            strategies = strategies.len(),
            snapshots = scenario.len(),
            execution = ?self.mode,
            "comparison started"
        );

        let outcomes = self.run_all(strategies, scenario.snapshots(), cancel)?;

        let mut results = Vec::with_capacity(strategies.len());
        let mut runs = Vec::with_capacity(strategies.len());
        let mut skipped = Vec::new();
        for (strategy, outcome) in strategies.iter().zip(outcomes) {
            match outcome {
                Some(o) => {
                    results.push(ComparisonResult::from_run(&o, measure(&o, strategy)));
                    runs.push(StrategyRunReport::from(o));
                }
                None => skipped.push(strategy.id.clone()),
            }
        }
        rank_results(&mut results, self.policy.as_ref());
        runs.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        skipped.sort();

        let cancelled = !skipped.is_empty();
        if cancelled {
            tracing::warn!(skipped = skipped.len(), "comparison cancelled");
        }
        if let Some(best) = results.first() {
            tracing::info!(
                best = %best.strategy_id,
                score = ?best.score,
                protection = best.protection_ratio,
                cost_pct = best.cost_percentage,
                "comparison finished"
            );
        }

        Ok(ComparisonReport {
            scenario_name: scenario.name.clone(),
            digest,
            mode,
            policy: self.policy.name(),
            results,
            runs,
            cancelled,
            skipped_strategies: skipped,
        })
    }

    /// One outcome per strategy, in input order. None marks a run that was
    /// never started because of cancellation.
    fn run_all(
        &self,
        strategies: &[HedgingStrategyDefinition],
        snapshots: &[MarketSnapshot],
        cancel: &CancellationFlag,
    ) -> HedgeResult<Vec<Option<RunOutcome>>> {
        let ctx = RunContext {
            engine: &self.engine,
            analyzer: &self.analyzer,
            settings: &self.settings,
        };
        let run_one = |strategy: &HedgingStrategyDefinition| -> HedgeResult<Option<RunOutcome>> {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            Ok(Some(StrategyRun::new(strategy, ctx)?.run(snapshots)))
        };

        match self.mode {
            ExecutionMode::Sequential => strategies.iter().map(run_one).collect(),
            ExecutionMode::Parallel => strategies.par_iter().map(run_one).collect(),
        }
    }
}

/// Configuration errors abort before any simulation starts.
fn validate_strategies(strategies: &[HedgingStrategyDefinition]) -> HedgeResult<()> {
    if strategies.is_empty() {
        return Err(HedgeError::Config("no strategies to compare".into()));
    }
    let mut seen = HashSet::new();
    for s in strategies {
        s.validate()?;
        if !seen.insert(s.id.as_str()) {
            return Err(HedgeError::Config(format!("duplicate strategy id '{}'", s.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ranking::ProtectionPerCost;
    use crate::analysis::scenarios::StressProfile;
    use crate::strategy::triggers;
    use chrono::TimeZone;

    fn engine(mode: ExecutionMode) -> ComparisonEngine {
        ComparisonEngine::new(EngineSettings::default(), RegimeConfig::default(), JumpParams::default())
            .unwrap()
            .with_mode(mode)
    }

    fn strategies() -> Vec<HedgingStrategyDefinition> {
        vec![
            HedgingStrategyDefinition::two_month_15pct_otm(),
            HedgingStrategyDefinition::six_month_15pct_otm(),
            HedgingStrategyDefinition::new("spx-3m-10otm", 0.10, 80, 100).with_triggers(triggers::drawdown_ladder()),
        ]
    }

    fn scenario() -> HistoricalScenario {
        StressProfile::Covid2020.scenario(4500.0, 0.05).unwrap()
    }

    #[test]
    fn test_independent_runs_order_and_mode_invariant() {
        let sc = scenario();
        let cancel = CancellationFlag::new();
        let seq = engine(ExecutionMode::Sequential).compare_scenario(&strategies(), &sc, &cancel).unwrap();
        let par = engine(ExecutionMode::Parallel).compare_scenario(&strategies(), &sc, &cancel).unwrap();
        let mut reversed = strategies();
        reversed.reverse();
        let rev = engine(ExecutionMode::Sequential).compare_scenario(&reversed, &sc, &cancel).unwrap();

        assert_eq!(seq.results, par.results);
        assert_eq!(seq.results, rev.results);
        assert_eq!(seq.runs, par.runs);
        assert_eq!(seq.digest, par.digest);
        assert!(!seq.cancelled);
    }

    #[test]
    fn test_scenario_metrics_are_finite() {
        let sc = scenario();
        let report = engine(ExecutionMode::Parallel)
            .compare_scenario(&strategies(), &sc, &CancellationFlag::new())
            .unwrap();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.mode, AnalysisMode::Scenario);
        let ranks: Vec<usize> = report.results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        for r in &report.results {
            for x in [r.annual_cost, r.cost_percentage, r.protection_ratio, r.jump_risk_premium, r.sharpe] {
                assert!(x.is_finite(), "{}: non-finite metric", r.strategy_id);
            }
            assert!(r.annual_cost > 0.0, "{} never bought protection", r.strategy_id);
            assert!(r.protection_ratio > 0.0);
            assert_eq!(r.pnl_path.len(), sc.len());
        }
        for run in &report.runs {
            assert!(run.counts.entries >= 1, "{}: {:?}", run.strategy_id, run.annotations);
            assert!(run.open_positions <= 1);
        }
    }

    #[test]
    fn test_point_in_time() {
        let snap = MarketSnapshot::new(Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).unwrap(), "SPX", 5200.0, 0.05, 13.0);
        let report = engine(ExecutionMode::Sequential)
            .compare_point_in_time(&strategies(), &snap, &CancellationFlag::new())
            .unwrap();
        assert_eq!(report.mode, AnalysisMode::PointInTime);
        assert_eq!(report.results.len(), 3);
        for r in &report.results {
            assert!(r.protection_ratio > 1.0, "{}: stressed put must be worth more", r.strategy_id);
            assert!(r.cost_percentage > 0.0 && r.cost_percentage < 1.0);
            assert!(r.greeks.delta < 0.0);
        }
    }

    #[test]
    fn test_rerank_without_rerun() {
        let sc = scenario();
        let mut report = engine(ExecutionMode::Sequential)
            .compare_scenario(&strategies(), &sc, &CancellationFlag::new())
            .unwrap();
        let mut before: Vec<_> = report.results.iter().map(|r| (r.strategy_id.clone(), r.protection_ratio)).collect();
        report.rerank(&ProtectionPerCost);
        assert_eq!(report.policy, "protection_per_cost");
        let mut after: Vec<_> = report.results.iter().map(|r| (r.strategy_id.clone(), r.protection_ratio)).collect();
        before.sort_by(|a, b| a.0.cmp(&b.0));
        after.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(before, after, "raw metrics unchanged by re-ranking");
        assert!(report.results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let report = engine(ExecutionMode::Parallel).compare_scenario(&strategies(), &scenario(), &cancel).unwrap();
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert_eq!(report.skipped_strategies.len(), 3);
    }

    #[test]
    fn test_config_errors_abort() {
        let sc = scenario();
        let cancel = CancellationFlag::new();
        let e = engine(ExecutionMode::Sequential);

        let bad = vec![HedgingStrategyDefinition::new("bad", 0.15, 90, 60)];
        assert!(matches!(e.compare_scenario(&bad, &sc, &cancel), Err(HedgeError::Config(_))));

        let dup = vec![HedgingStrategyDefinition::two_month_15pct_otm(), HedgingStrategyDefinition::two_month_15pct_otm()];
        assert!(matches!(e.compare_scenario(&dup, &sc, &cancel), Err(HedgeError::Config(_))));

        assert!(e.compare_scenario(&[], &sc, &cancel).is_err());
    }
}
