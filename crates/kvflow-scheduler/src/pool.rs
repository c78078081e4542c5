//! Worker pool: registry and load accounting for prefill/decode workers.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::WorkerSeed;
use crate::strategy::SelectionStrategy;

/// Unique worker identifier.
pub type WorkerId = String;

/// Maximum concurrency applied when a seed leaves it unset.
pub const DEFAULT_MAX_CONCURRENCY: u32 = 32;

/// Role of a worker in the disaggregated pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Compute-bound prompt ingestion; produces the KV cache.
    Prefill,
    /// Bandwidth-bound token emission; consumes the KV cache.
    Decode,
}

impl WorkerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prefill => "prefill",
            Self::Decode => "decode",
        }
    }
}

/// Worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Ready for new requests.
    Idle,
    /// Saturated; at maximum concurrency.
    Busy,
    /// Operator-requested drain: no new assignments, in-flight work finishes.
    Draining,
    /// Failed or stale; sticky until a successful probe or re-registration.
    Offline,
}

impl WorkerStatus {
    /// Returns true if the status permits new assignments (capacity aside).
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

/// A registered worker.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Unique worker identifier.
    pub id: WorkerId,
    /// Opaque address used for dispatch and transfers.
    pub endpoint: String,
    /// Pool the worker serves.
    pub role: WorkerRole,
    /// Model the worker hosts.
    pub model_id: String,
    /// Current status.
    pub status: WorkerStatus,
    /// Most recent GPU utilisation reading, 0.0-1.0.
    pub gpu_utilization: f64,
    /// Requests currently assigned.
    pub active_requests: u32,
    /// Maximum concurrent requests.
    pub max_concurrency: u32,
    /// Time of the last successful probe or registration.
    pub last_health_check: Instant,
}

impl Worker {
    fn from_seed(seed: &WorkerSeed) -> Self {
        Self {
            id: seed.id.clone(),
            endpoint: seed.endpoint.clone(),
            role: seed.role,
            model_id: seed.model_id.clone(),
            status: WorkerStatus::Idle,
            gpu_utilization: 0.0,
            active_requests: 0,
            max_concurrency: seed.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            last_health_check: Instant::now(),
        }
    }

    /// Returns true if the worker has room for another request.
    #[must_use]
    pub const fn has_capacity(&self) -> bool {
        self.active_requests < self.max_concurrency
    }

    /// Returns true if the worker can accept a new assignment.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.status.is_schedulable() && self.has_capacity()
    }
}

/// Patch applied by the health monitor after a probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetricsPatch {
    pub gpu_utilization: Option<f64>,
    pub active_requests: Option<u32>,
    pub status: Option<WorkerStatus>,
}

/// Thread-safe registry of workers keyed by id.
///
/// The pool is the only mutator of worker state; the scheduler drives load
/// through [`increment_active`](Self::increment_active) /
/// [`decrement_active`](Self::decrement_active) and the health monitor
/// patches metrics and status.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: DashMap<WorkerId, Worker>,
}

impl WorkerPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    /// Registers a worker, or refreshes an existing registration.
    ///
    /// Re-registration preserves runtime state (utilisation, active count,
    /// status — except `Offline`, which it clears) while always updating
    /// endpoint, role, model, and concurrency limit, and refreshing the
    /// last-seen timestamp.
    pub fn register(&self, seed: &WorkerSeed) -> Worker {
        let mut entry = self
            .workers
            .entry(seed.id.clone())
            .or_insert_with(|| Worker::from_seed(seed));

        let worker = entry.value_mut();
        worker.endpoint = seed.endpoint.clone();
        worker.role = seed.role;
        worker.model_id = seed.model_id.clone();
        worker.max_concurrency = seed.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        worker.last_health_check = Instant::now();
        if worker.status == WorkerStatus::Offline {
            worker.status = WorkerStatus::Idle;
        }

        worker.clone()
    }

    /// Removes a worker. Returns false if it was not registered.
    pub fn remove(&self, id: &str) -> bool {
        self.workers.remove(id).is_some()
    }

    /// Gets a snapshot of a worker by id.
    pub fn get(&self, id: &str) -> Option<Worker> {
        self.workers.get(id).map(|r| r.clone())
    }

    /// Lists workers, optionally filtered by role, ordered by id.
    pub fn list(&self, role: Option<WorkerRole>) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .workers
            .iter()
            .filter(|r| role.map_or(true, |role| r.role == role))
            .map(|r| r.clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Lists workers of a role that can accept a new assignment.
    ///
    /// Excludes draining and offline workers and those at capacity.
    /// Candidates are ordered by id so selection is deterministic.
    pub fn available(&self, role: WorkerRole) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .workers
            .iter()
            .filter(|r| r.role == role && r.is_available())
            .map(|r| r.clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Selects one available worker of the role via the given strategy.
    pub fn select(&self, role: WorkerRole, strategy: &dyn SelectionStrategy) -> Option<Worker> {
        let candidates = self.available(role);
        let id = strategy.select(role, &candidates)?;
        self.get(&id)
    }

    /// Records a new assignment on a worker.
    ///
    /// Flips `Idle` to `Busy` on saturation; never overrides `Offline` or
    /// `Draining`.
    pub fn increment_active(&self, id: &str) {
        if let Some(mut worker) = self.workers.get_mut(id) {
            if worker.active_requests < worker.max_concurrency {
                worker.active_requests += 1;
            }
            if worker.active_requests == worker.max_concurrency
                && worker.status == WorkerStatus::Idle
            {
                worker.status = WorkerStatus::Busy;
            }
        }
    }

    /// Records the end of an assignment on a worker, clamping at zero.
    ///
    /// Flips `Busy` back to `Idle` when capacity opens; never overrides
    /// `Offline` or `Draining`.
    pub fn decrement_active(&self, id: &str) {
        if let Some(mut worker) = self.workers.get_mut(id) {
            worker.active_requests = worker.active_requests.saturating_sub(1);
            if worker.active_requests < worker.max_concurrency
                && worker.status == WorkerStatus::Busy
            {
                worker.status = WorkerStatus::Idle;
            }
        }
    }

    /// Applies a probe-derived patch and refreshes the last-seen timestamp.
    ///
    /// Returns false if the worker is not registered.
    pub fn update_metrics(&self, id: &str, patch: WorkerMetricsPatch) -> bool {
        let Some(mut worker) = self.workers.get_mut(id) else {
            return false;
        };

        if let Some(utilization) = patch.gpu_utilization {
            worker.gpu_utilization = utilization;
        }
        if let Some(active) = patch.active_requests {
            worker.active_requests = active;
        }
        if let Some(status) = patch.status {
            worker.status = status;
        }
        worker.last_health_check = Instant::now();
        true
    }

    /// Marks a worker offline. Returns true if this changed its status.
    pub fn mark_offline(&self, id: &str) -> bool {
        let Some(mut worker) = self.workers.get_mut(id) else {
            return false;
        };
        if worker.status == WorkerStatus::Offline {
            return false;
        }
        worker.status = WorkerStatus::Offline;
        true
    }

    /// Marks a worker as draining. Returns false if it was not registered.
    pub fn drain(&self, id: &str) -> bool {
        let Some(mut worker) = self.workers.get_mut(id) else {
            return false;
        };
        worker.status = WorkerStatus::Draining;
        true
    }

    /// Marks every non-offline worker unseen for longer than `timeout` as
    /// offline and returns their ids.
    pub fn expire_stale_workers(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = Instant::now();
        let mut expired = Vec::new();

        for mut entry in self.workers.iter_mut() {
            let worker = entry.value_mut();
            if worker.status != WorkerStatus::Offline
                && now.duration_since(worker.last_health_check) > timeout
            {
                worker.status = WorkerStatus::Offline;
                expired.push(worker.id.clone());
            }
        }

        expired
    }

    /// Returns the number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
