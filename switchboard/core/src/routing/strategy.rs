//! Selection Strategies
//!
//! Each strategy picks one provider from the already-filtered eligible list.
//! Candidates arrive in configuration order; when a strategy's own
//! tie-breakers cannot separate two candidates, the earlier one wins.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::distributions::{Distribution, WeightedIndex};

use super::config::StrategyKind;

/// What a strategy knows about an eligible provider
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub provider_id: String,
    pub model: String,
    pub estimated_cost: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub success_rate: f64,
    pub weight: f64,
}

/// A provider selection strategy
pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Index of the chosen candidate, `None` only when `candidates` is empty
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;
}

/// Build a fresh strategy instance
#[must_use]
pub fn build_strategy(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::CostBased => Box::new(CostBased),
        StrategyKind::PerformanceBased => Box::new(PerformanceBased),
        StrategyKind::QualityBased => Box::new(QualityBased),
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::Weighted => Box::new(Weighted),
    }
}

/// First index minimizing `cmp`; earlier candidates win exact ties
fn min_index_by<F>(candidates: &[Candidate], mut cmp: F) -> Option<usize>
where
    F: FnMut(&Candidate, &Candidate) -> CmpOrdering,
{
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp(a, b))
        .map(|(i, _)| i)
}

// ============================================================================
// Strategies
// ============================================================================

/// Lowest estimated cost, then lowest p50 latency
#[derive(Debug, Default)]
pub struct CostBased;

impl SelectionStrategy for CostBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CostBased
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        min_index_by(candidates, |a, b| {
            a.estimated_cost
                .total_cmp(&b.estimated_cost)
                .then(a.p50_latency_ms.total_cmp(&b.p50_latency_ms))
        })
    }
}

/// Lowest rolling-average latency, then highest success rate
#[derive(Debug, Default)]
pub struct PerformanceBased;

impl SelectionStrategy for PerformanceBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PerformanceBased
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        min_index_by(candidates, |a, b| {
            a.avg_latency_ms
                .total_cmp(&b.avg_latency_ms)
                .then(b.success_rate.total_cmp(&a.success_rate))
        })
    }
}

/// Highest rolling success rate, then lowest cost
#[derive(Debug, Default)]
pub struct QualityBased;

impl SelectionStrategy for QualityBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::QualityBased
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        min_index_by(candidates, |a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.estimated_cost.total_cmp(&b.estimated_cost))
        })
    }
}

/// Cyclic cursor over the eligible list, advanced on every selection
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(position % candidates.len())
    }
}

/// Weighted random draw, renormalized over the eligible candidates
#[derive(Debug, Default)]
pub struct Weighted;

impl SelectionStrategy for Weighted {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Weighted
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let weights = candidates.iter().map(|c| c.weight.max(0.0));
        match WeightedIndex::new(weights) {
            Ok(dist) => Some(dist.sample(&mut rand::thread_rng())),
            // Every eligible weight is zero
            Err(_) => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidate(id: &str, cost: f64, latency: f64, success: f64) -> Candidate {
        Candidate {
            provider_id: id.to_string(),
            model: format!("{id}-model"),
            estimated_cost: cost,
            avg_latency_ms: latency,
            p50_latency_ms: latency,
            success_rate: success,
            weight: 1.0,
        }
    }

    fn pick(strategy: &dyn SelectionStrategy, candidates: &[Candidate]) -> String {
        let idx = strategy.select(candidates).unwrap();
        candidates[idx].provider_id.clone()
    }

    #[test]
    fn test_cost_based() {
        let candidates = vec![
            candidate("a", 0.02, 100.0, 1.0),
            candidate("b", 0.01, 300.0, 1.0),
            candidate("c", 0.01, 200.0, 1.0),
        ];
        assert_eq!(pick(&CostBased, &candidates), "c");
    }

    #[test]
    fn test_cost_tie_falls_back_to_config_order() {
        let candidates = vec![candidate("a", 0.01, 0.0, 1.0), candidate("b", 0.01, 0.0, 1.0)];
        assert_eq!(pick(&CostBased, &candidates), "a");
    }

    #[test]
    fn test_performance_based() {
        let candidates = vec![
            candidate("a", 0.01, 300.0, 1.0),
            candidate("b", 0.05, 100.0, 0.5),
            candidate("c", 0.05, 100.0, 0.9),
        ];
        assert_eq!(pick(&PerformanceBased, &candidates), "c");
    }

    #[test]
    fn test_quality_based() {
        let candidates = vec![
            candidate("a", 0.03, 100.0, 0.8),
            candidate("b", 0.02, 900.0, 0.95),
            candidate("c", 0.01, 900.0, 0.95),
        ];
        assert_eq!(pick(&QualityBased, &candidates), "c");
    }

    #[test]
    fn test_round_robin_cycles() {
        let strategy = RoundRobin::new();
        let candidates = vec![
            candidate("a", 0.0, 0.0, 1.0),
            candidate("b", 0.0, 0.0, 1.0),
            candidate("c", 0.0, 0.0, 1.0),
        ];

        let picks: Vec<String> = (0..6).map(|_| pick(&strategy, &candidates)).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
        assert_eq!(strategy.select(&[]), None);
    }

    #[test]
    fn test_weighted_respects_zero_weight() {
        let mut candidates = vec![candidate("a", 0.0, 0.0, 1.0), candidate("b", 0.0, 0.0, 1.0)];
        candidates[0].weight = 0.0;
        candidates[1].weight = 3.0;

        for _ in 0..50 {
            assert_eq!(pick(&Weighted, &candidates), "b");
        }
    }

    #[test]
    fn test_weighted_all_zero_picks_first() {
        let mut candidates = vec![candidate("a", 0.0, 0.0, 1.0), candidate("b", 0.0, 0.0, 1.0)];
        candidates[0].weight = 0.0;
        candidates[1].weight = 0.0;
        assert_eq!(pick(&Weighted, &candidates), "a");
    }

    #[test]
    fn test_weighted_distribution_roughly_proportional() {
        let mut candidates = vec![candidate("a", 0.0, 0.0, 1.0), candidate("b", 0.0, 0.0, 1.0)];
        candidates[0].weight = 1.0;
        candidates[1].weight = 3.0;

        let b_picks = (0..4000)
            .filter(|_| pick(&Weighted, &candidates) == "b")
            .count();
        // Expected 3000; generous bounds keep this deterministic in practice
        assert!((2600..3400).contains(&b_picks), "b picked {b_picks} times");
    }

    #[test]
    fn test_build_strategy_kinds() {
        for kind in StrategyKind::ALL {
            assert_eq!(build_strategy(kind).kind(), kind);
        }
    }
}
