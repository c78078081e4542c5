//! Worker selection strategies.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{SelectionWeights, StrategyKind};
use crate::pool::{Worker, WorkerId, WorkerRole};

/// Trait for worker selection strategies.
///
/// Candidates are pre-filtered to available workers of the requested role,
/// ordered by id. A strategy that declines to choose falls back to the first
/// candidate at the call site.
pub trait SelectionStrategy: Send + Sync {
    /// Selects a worker from the candidates, or `None` if there are none.
    fn select(&self, role: WorkerRole, candidates: &[Worker]) -> Option<WorkerId>;

    /// Returns the strategy name.
    fn name(&self) -> &'static str;
}

/// Builds the strategy named by configuration.
#[must_use]
pub fn for_kind(kind: StrategyKind, weights: SelectionWeights) -> Arc<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
        StrategyKind::LeastLoaded => Arc::new(LeastLoaded::new()),
        StrategyKind::LatencyAware => Arc::new(LatencyAware::new()),
        StrategyKind::Weighted => Arc::new(Weighted::new(weights)),
    }
}

/// Round-robin selection.
///
/// Keeps one counter per role; the counter advances on every call, whether or
/// not a candidate is returned, so prefill and decode rotations stay
/// independent.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: DashMap<WorkerRole, AtomicU64>,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, role: WorkerRole, candidates: &[Worker]) -> Option<WorkerId> {
        let counter = self.counters.entry(role).or_default();
        let count = counter.fetch_add(1, Ordering::Relaxed);

        if candidates.is_empty() {
            return None;
        }

        let index = count as usize % candidates.len();
        Some(candidates[index].id.clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Least-loaded selection: fewest active requests wins, ties break toward the
/// first candidate.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for LeastLoaded {
    fn select(&self, _role: WorkerRole, candidates: &[Worker]) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by_key(|w| w.active_requests)
            .map(|w| w.id.clone())
    }

    fn name(&self) -> &'static str {
        "least-loaded"
    }
}

/// Latency-aware selection.
///
/// GPU utilisation is the latency proxy the workers report; lowest wins.
#[derive(Debug, Default)]
pub struct LatencyAware;

impl LatencyAware {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for LatencyAware {
    fn select(&self, _role: WorkerRole, candidates: &[Worker]) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.gpu_utilization
                    .partial_cmp(&b.gpu_utilization)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|w| w.id.clone())
    }

    fn name(&self) -> &'static str {
        "latency-aware"
    }
}

/// Weighted selection: scores candidates by load, utilisation, and probe
/// staleness; lowest score wins.
#[derive(Debug)]
pub struct Weighted {
    weights: SelectionWeights,
}

impl Weighted {
    #[must_use]
    pub const fn new(weights: SelectionWeights) -> Self {
        Self { weights }
    }

    fn score(&self, worker: &Worker) -> f64 {
        let staleness = worker.last_health_check.elapsed().as_secs_f64();
        self.weights.load * f64::from(worker.active_requests)
            + self.weights.utilization * worker.gpu_utilization
            + self.weights.staleness * staleness
    }
}

impl SelectionStrategy for Weighted {
    fn select(&self, _role: WorkerRole, candidates: &[Worker]) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.score(a)
                    .partial_cmp(&self.score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|w| w.id.clone())
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerStatus;
    use std::time::Instant;

    fn worker(id: &str, active: u32, utilization: f64) -> Worker {
        Worker {
            id: id.to_string(),
            endpoint: format!("http://{id}:8000"),
            role: WorkerRole::Prefill,
            model_id: "m".to_string(),
            status: WorkerStatus::Idle,
            gpu_utilization: utilization,
            active_requests: active,
            max_concurrency: 8,
            last_health_check: Instant::now(),
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let rr = RoundRobin::new();
        let candidates = vec![worker("w0", 0, 0.0), worker("w1", 0, 0.0), worker("w2", 0, 0.0)];

        let picks: Vec<_> = (0..6)
            .map(|_| rr.select(WorkerRole::Prefill, &candidates).unwrap())
            .collect();
        assert_eq!(picks, vec!["w0", "w1", "w2", "w0", "w1", "w2"]);
    }

    #[test]
    fn round_robin_counters_are_per_role() {
        let rr = RoundRobin::new();
        let prefill = vec![worker("p0", 0, 0.0), worker("p1", 0, 0.0)];
        let decode = vec![worker("d0", 0, 0.0), worker("d1", 0, 0.0)];

        assert_eq!(rr.select(WorkerRole::Prefill, &prefill).unwrap(), "p0");
        assert_eq!(rr.select(WorkerRole::Decode, &decode).unwrap(), "d0");
        assert_eq!(rr.select(WorkerRole::Prefill, &prefill).unwrap(), "p1");
        assert_eq!(rr.select(WorkerRole::Decode, &decode).unwrap(), "d1");
    }

    #[test]
    fn round_robin_advances_on_empty_calls() {
        let rr = RoundRobin::new();
        let candidates = vec![worker("w0", 0, 0.0), worker("w1", 0, 0.0)];

        assert_eq!(rr.select(WorkerRole::Prefill, &candidates).unwrap(), "w0");
        assert!(rr.select(WorkerRole::Prefill, &[]).is_none());
        // The empty call consumed a slot in the rotation.
        assert_eq!(rr.select(WorkerRole::Prefill, &candidates).unwrap(), "w0");
    }

    #[test]
    fn least_loaded_picks_minimum_with_first_tie_break() {
        let ll = LeastLoaded::new();
        let candidates = vec![worker("w0", 5, 0.0), worker("w1", 2, 0.0), worker("w2", 2, 0.0)];

        assert_eq!(ll.select(WorkerRole::Prefill, &candidates).unwrap(), "w1");
    }

    #[test]
    fn latency_aware_picks_lowest_utilisation() {
        let la = LatencyAware::new();
        let candidates = vec![worker("w0", 0, 0.9), worker("w1", 0, 0.1), worker("w2", 0, 0.5)];

        assert_eq!(la.select(WorkerRole::Prefill, &candidates).unwrap(), "w1");
    }

    #[test]
    fn weighted_prefers_low_load_and_utilisation() {
        let weighted = Weighted::new(SelectionWeights::default());
        let candidates = vec![worker("w0", 6, 0.9), worker("w1", 1, 0.2), worker("w2", 4, 0.4)];

        assert_eq!(
            weighted.select(WorkerRole::Prefill, &candidates).unwrap(),
            "w1"
        );
    }

    #[test]
    fn empty_candidates_select_none() {
        assert!(LeastLoaded::new().select(WorkerRole::Decode, &[]).is_none());
        assert!(LatencyAware::new().select(WorkerRole::Decode, &[]).is_none());
        assert!(Weighted::new(SelectionWeights::default())
            .select(WorkerRole::Decode, &[])
            .is_none());
    }
}
