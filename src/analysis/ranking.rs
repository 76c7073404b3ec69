use crate::analysis::comparison::ComparisonResult;
use crate::errors::{HedgeError, HedgeResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Scores a finished result. Higher is better. Policies see only the raw
/// metrics, so swapping one never requires re-running a simulation.
pub trait RankingPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, result: &ComparisonResult) -> f64;
}

/// `w_p * protection_ratio - w_c * cost_percentage * 100`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub protection_weight: f64,
    pub cost_weight: f64,
}

impl Default for CompositeScore {
    fn default() -> Self {
        Self {
            protection_weight: 0.6,
            cost_weight: 0.4,
        }
    }
}

impl CompositeScore {
    pub fn validate(&self) -> HedgeResult<()> {
        let w = [self.protection_weight, self.cost_weight];
        if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(HedgeError::Config(format!(
                "ranking weights must be finite and >= 0 (protection={}, cost={})",
                self.protection_weight, self.cost_weight
            )));
        }
        if w.iter().all(|x| *x == 0.0) {
            return Err(HedgeError::Config("ranking weights must not both be zero".into()));
        }
        Ok(())
    }
}

impl RankingPolicy for CompositeScore {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn score(&self, r: &ComparisonResult) -> f64 {
        self.protection_weight * r.protection_ratio - self.cost_weight * r.cost_percentage * 100.0
    }
}

/// Protection bought per unit of annual cost.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProtectionPerCost;

impl RankingPolicy for ProtectionPerCost {
    fn name(&self) -> &'static str {
        "protection_per_cost"
    }

    fn score(&self, r: &ComparisonResult) -> f64 {
        r.protection_ratio / r.cost_percentage.max(1e-9)
    }
}

/// Score, sort best first and assign ranks from 1. Ties go to the smaller
/// strategy id so the order never depends on input order. Non-finite scores
/// are dropped and those results sort last.
pub fn rank_results(results: &mut [ComparisonResult], policy: &dyn RankingPolicy) {
    for r in results.iter_mut() {
        r.score = Some(policy.score(r)).filter(|s| s.is_finite());
    }
    results.sort_by(|a, b| {
        let ord = match (a.score, b.score) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        ord.then_with(|| a.strategy_id.cmp(&b.strategy_id))
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Greeks;

    fn result(id: &str, protection: f64, cost_pct: f64) -> ComparisonResult {
        ComparisonResult {
            strategy_id: id.into(),
            annual_cost: cost_pct * 100_000.0,
            cost_percentage: cost_pct,
            protection_ratio: protection,
            jump_risk_premium: 0.1,
            greeks: Greeks::default(),
            rank: 0,
            score: None,
            total_return: 0.0,
            max_drawdown: 0.0,
            sharpe: 0.0,
            pnl_path: Vec::new(),
        }
    }

    #[test]
    fn test_composite_ranking() {
        let mut rs = vec![result("cheap", 2.0, 0.01), result("strong", 8.0, 0.04)];
        rank_results(&mut rs, &CompositeScore::default());
        // cheap: 1.2 - 0.4 = 0.8; strong: 4.8 - 1.6 = 3.2
        assert_eq!(rs[0].strategy_id, "strong");
        assert_eq!(rs[0].rank, 1);
        assert_eq!(rs[1].rank, 2);
        assert!((rs[0].score.unwrap() - 3.2).abs() < 1e-12);
    }

    #[test]
    fn test_policy_substitution_reorders() {
        let mut rs = vec![result("cheap", 2.0, 0.01), result("strong", 8.0, 0.04)];
        rank_results(&mut rs, &CompositeScore::default());
        assert_eq!(rs[0].strategy_id, "strong");

        let cost_only = CompositeScore { protection_weight: 0.0, cost_weight: 1.0 };
        rank_results(&mut rs, &cost_only);
        assert_eq!(rs[0].strategy_id, "cheap");

        let mut tied = vec![result("b", 4.0, 0.5), result("a", 2.0, 0.25)];
        rank_results(&mut tied, &ProtectionPerCost);
        assert_eq!(tied[0].score, tied[1].score);
        assert_eq!(tied[0].strategy_id, "a", "tie broken by id");
    }

    #[test]
    fn test_non_finite_scores_sort_last() {
        struct Broken;
        impl RankingPolicy for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn score(&self, r: &ComparisonResult) -> f64 {
                if r.strategy_id == "a" { f64::NAN } else { 1.0 }
            }
        }
        let mut rs = vec![result("a", 1.0, 0.01), result("b", 1.0, 0.01)];
        rank_results(&mut rs, &Broken);
        assert_eq!(rs[0].strategy_id, "b");
        assert_eq!(rs[0].score, Some(1.0));
        assert_eq!(rs[1].score, None);
        assert_eq!(rs[1].rank, 2);

        let json = serde_json::to_value(&rs[1]).unwrap();
        assert!(json.get("score").is_none(), "unscored result omits the field");
        let json = serde_json::to_value(&rs[0]).unwrap();
        assert_eq!(json["score"], 1.0);
    }

    #[test]
    fn test_weight_validation() {
        assert!(CompositeScore::default().validate().is_ok());
        assert!(CompositeScore { protection_weight: -1.0, cost_weight: 0.4 }.validate().is_err());
        assert!(CompositeScore { protection_weight: 0.0, cost_weight: 0.0 }.validate().is_err());
    }
}
