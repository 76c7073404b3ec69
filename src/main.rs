use serde::Serialize;
use std::path::Path;
use tailguard::analysis::comparison::{CancellationFlag, ComparisonEngine, ComparisonReport, ExecutionMode};
use tailguard::config::AppConfig;
use tailguard::errors::{HedgeError, HedgeResult};
use tailguard::strategy::definition::HedgingStrategyDefinition;

#[derive(Serialize)]
struct Report<'a> {
    point_in_time: &'a ComparisonReport,
    scenario: &'a ComparisonReport,
}

fn main() {
    // Logs go to stderr; stdout carries only the JSON report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("tailguard starting");

    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&cfg) {
        tracing::error!(kind = e.kind(), "comparison failed: {e}");
        std::process::exit(1);
    }
}

fn run(cfg: &AppConfig) -> HedgeResult<()> {
    let strategies = match &cfg.strategies_path {
        Some(path) => load_strategies(path)?,
        None => vec![
            HedgingStrategyDefinition::two_month_15pct_otm(),
            HedgingStrategyDefinition::six_month_15pct_otm(),
            HedgingStrategyDefinition::three_month_10pct_otm_laddered(),
        ],
    };
    tracing::info!(count = strategies.len(), scenario = %cfg.scenario, "strategies loaded");

    let mode = if cfg.parallel {
        ExecutionMode::Parallel
    } else {
        ExecutionMode::Sequential
    };
    let engine = ComparisonEngine::new(cfg.engine.clone(), cfg.regime.clone(), cfg.jump)?
        .with_mode(mode)
        .with_policy(cfg.ranking);

    let scenario = cfg.scenario.scenario(cfg.scenario_start_spot, cfg.risk_free_rate)?;
    let cancel = CancellationFlag::new();

    let first = scenario
        .snapshots()
        .first()
        .ok_or_else(|| HedgeError::Config("empty scenario".into()))?;
    let point_in_time = engine.compare_point_in_time(&strategies, first, &cancel)?;
    let replay = engine.compare_scenario(&strategies, &scenario, &cancel)?;

    for r in &replay.results {
        tracing::info!(
            rank = r.rank,
            strategy = %r.strategy_id,
            annual_cost = r.annual_cost,
            cost_pct = r.cost_percentage,
            protection = r.protection_ratio,
            jrp = r.jump_risk_premium,
            "ranked"
        );
    }

    let report = Report {
        point_in_time: &point_in_time,
        scenario: &replay,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_strategies(path: &Path) -> HedgeResult<Vec<HedgingStrategyDefinition>> {
    let raw = std::fs::read_to_string(path)?;
    let strategies: Vec<HedgingStrategyDefinition> = serde_json::from_str(&raw)?;
    tracing::info!(path = %path.display(), count = strategies.len(), "loaded strategy file");
    Ok(strategies)
}
