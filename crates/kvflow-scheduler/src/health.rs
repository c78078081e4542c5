//! Health monitoring: worker probes, rolling latency windows, counters, and
//! the event log.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::client::WorkerClient;
use crate::events::{EventKind, EventLog, SchedulerEvent, DEFAULT_EVENT_LIMIT};
use crate::pool::{Worker, WorkerMetricsPatch, WorkerPool, WorkerRole, WorkerStatus};

/// Samples retained per latency window.
pub const LATENCY_WINDOW_CAPACITY: usize = 200;

/// Fixed-capacity rolling window of latency samples.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a sample, evicting the oldest at capacity.
    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Arithmetic mean rounded to the nearest integer; 0 when empty.
    #[must_use]
    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().sum();
        let len = self.samples.len() as u64;
        (sum + len / 2) / len
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW_CAPACITY)
    }
}

/// Point-in-time scheduler metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub queue_depth: usize,
    pub active_prefills: usize,
    pub active_transfers: usize,
    pub active_decodes: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub avg_latency_ms: u64,
    pub avg_prefill_latency_ms: u64,
    pub avg_decode_latency_ms: u64,
    pub workers: Vec<WorkerSnapshot>,
}

/// Per-worker slice of a metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    pub gpu_utilization: f64,
    pub active_requests: u32,
}

impl From<&Worker> for WorkerSnapshot {
    fn from(worker: &Worker) -> Self {
        Self {
            id: worker.id.clone(),
            role: worker.role,
            status: worker.status,
            gpu_utilization: worker.gpu_utilization,
            active_requests: worker.active_requests,
        }
    }
}

/// Tracks worker health and aggregates request outcomes.
///
/// Owns the completed/failed counters, the three latency windows, and the
/// event log; the scheduler feeds it through
/// [`record_completion`](Self::record_completion) /
/// [`record_failure`](Self::record_failure) and
/// [`emit`](Self::emit).
pub struct HealthMonitor {
    pool: Arc<WorkerPool>,
    client: Arc<dyn WorkerClient>,
    worker_timeout: Duration,
    completed: AtomicU64,
    failed: AtomicU64,
    total_latency: Mutex<LatencyWindow>,
    prefill_latency: Mutex<LatencyWindow>,
    decode_latency: Mutex<LatencyWindow>,
    events: EventLog,
}

impl HealthMonitor {
    /// Creates a monitor over the pool and client.
    pub fn new(
        pool: Arc<WorkerPool>,
        client: Arc<dyn WorkerClient>,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            worker_timeout,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_latency: Mutex::new(LatencyWindow::default()),
            prefill_latency: Mutex::new(LatencyWindow::default()),
            decode_latency: Mutex::new(LatencyWindow::default()),
            events: EventLog::default(),
        }
    }

    /// Records a completed request and its per-phase latencies.
    pub fn record_completion(&self, total_ms: u64, prefill_ms: u64, decode_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency.lock().record(total_ms);
        self.prefill_latency.lock().record(prefill_ms);
        self.decode_latency.lock().record(decode_ms);
    }

    /// Records a failed request.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Emits a lifecycle event.
    pub fn emit(&self, kind: EventKind) {
        self.events.emit(kind);
    }

    /// Returns the newest events, up to `limit` (default 50).
    pub fn recent_events(&self, limit: Option<usize>) -> Vec<SchedulerEvent> {
        self.events.recent(limit.unwrap_or(DEFAULT_EVENT_LIMIT))
    }

    /// Subscribes to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Runs one probe sweep over the pool.
    ///
    /// All probes run concurrently; the tick settles once every probe has,
    /// never blocking on one slow worker beyond its own deadline. Draining
    /// workers are left alone; offline workers are probed so recovery can
    /// bring them back.
    pub async fn tick(&self) {
        let workers: Vec<Worker> = self
            .pool
            .list(None)
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Draining)
            .collect();

        let probes = workers.iter().map(|worker| {
            let client = self.client.clone();
            async move { client.health(worker).await }
        });
        let results = join_all(probes).await;

        for (worker, probe) in workers.iter().zip(results) {
            if probe.healthy {
                let was_offline = worker.status == WorkerStatus::Offline;
                let status = if probe.active_requests >= worker.max_concurrency {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Idle
                };
                self.pool.update_metrics(
                    &worker.id,
                    WorkerMetricsPatch {
                        gpu_utilization: Some(probe.gpu_utilization),
                        active_requests: Some(probe.active_requests),
                        status: Some(status),
                    },
                );
                if was_offline {
                    debug!(worker_id = %worker.id, "worker recovered");
                    self.emit(EventKind::WorkerOnline {
                        worker_id: worker.id.clone(),
                        role: worker.role,
                    });
                }
            } else if self.pool.mark_offline(&worker.id) {
                warn!(
                    worker_id = %worker.id,
                    error = probe.error.as_deref().unwrap_or("unknown"),
                    "worker probe failed"
                );
                self.emit(EventKind::WorkerOffline {
                    worker_id: worker.id.clone(),
                });
            }
        }

        for worker_id in self.pool.expire_stale_workers(self.worker_timeout) {
            warn!(worker_id = %worker_id, "worker stale, evicting");
            self.emit(EventKind::WorkerOffline { worker_id });
        }
    }

    /// Builds a metrics snapshot; the caller supplies the live pipeline
    /// gauges it owns.
    pub fn snapshot(
        &self,
        queue_depth: usize,
        active_prefills: usize,
        active_transfers: usize,
        active_decodes: usize,
    ) -> SchedulerMetrics {
        SchedulerMetrics {
            queue_depth,
            active_prefills,
            active_transfers,
            active_decodes,
            total_completed: self.completed.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: self.total_latency.lock().average(),
            avg_prefill_latency_ms: self.prefill_latency.lock().average(),
            avg_decode_latency_ms: self.decode_latency.lock().average(),
            workers: self.pool.list(None).iter().map(WorkerSnapshot::from).collect(),
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("worker_timeout", &self.worker_timeout)
            .field("completed", &self.completed)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_average_rounds_to_nearest() {
        let mut window = LatencyWindow::new(8);
        window.record(10);
        window.record(11);
        // Mean 10.5 rounds up.
        assert_eq!(window.average(), 11);

        window.record(10);
        // Mean 31/3 = 10.33 rounds down.
        assert_eq!(window.average(), 10);
    }

    #[test]
    fn window_empty_average_is_zero() {
        let window = LatencyWindow::new(4);
        assert_eq!(window.average(), 0);
        assert!(window.is_empty());
    }

    #[test]
    fn window_evicts_oldest_at_capacity() {
        let mut window = LatencyWindow::new(3);
        for sample in [100, 1, 1, 1] {
            window.record(sample);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), 1);
    }

    #[test]
    fn window_average_is_mean_of_stored_samples() {
        let mut window = LatencyWindow::new(200);
        for sample in [5, 10, 15, 20] {
            window.record(sample);
        }
        assert_eq!(window.average(), 13); // 50/4 = 12.5 → 13
    }
}
