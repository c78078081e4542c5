//! The scheduler: queue admission, dispatch, and the request pipeline.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::WorkerClient;
use crate::config::{SchedulerConfig, WorkerSeed};
use crate::error::{Result, SchedulerError};
use crate::events::{EventKind, SchedulerEvent};
use crate::health::{HealthMonitor, SchedulerMetrics};
use crate::pool::{Worker, WorkerPool, WorkerRole};
use crate::request::{
    InferenceRequest, InferenceResponse, RequestPhase, ResponseHandle,
};
use crate::strategy::{self, SelectionStrategy};
use crate::transfer::{KvTransferManager, KvTransport, TransferJob};

type Resolver = oneshot::Sender<Result<InferenceResponse>>;

/// A request waiting in the queue, carrying its settle handle.
struct QueuedEntry {
    request_id: String,
    seq: u64,
    request: InferenceRequest,
    created_at: Instant,
    timeout: Duration,
    resolver: Resolver,
}

/// A dispatched request's settle handle, keyed by request id.
struct InFlight {
    resolver: Resolver,
}

/// A request moving through the pipeline.
struct ActiveRequest {
    request_id: String,
    request: InferenceRequest,
    created_at: Instant,
    phase: RequestPhase,
}

impl ActiveRequest {
    fn advance(&mut self, phase: RequestPhase) {
        debug!(request_id = %self.request_id, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }
}

/// Dynamic request scheduler for disaggregated prefill/decode serving.
///
/// Requests are admitted into a priority queue; a periodic dispatch tick
/// moves at most one request per tick into the three-phase pipeline
/// (prefill → KV-cache transfer → decode). A health tick probes workers and
/// evicts stale ones. Both ticks stop on [`stop`](Self::stop); in-flight
/// pipelines run to completion.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    strategy: Arc<dyn SelectionStrategy>,
    client: Arc<dyn WorkerClient>,
    transfers: Arc<KvTransferManager>,
    monitor: Arc<HealthMonitor>,
    queue: Mutex<VecDeque<QueuedEntry>>,
    inflight: DashMap<String, InFlight>,
    next_seq: AtomicU64,
    active_prefills: AtomicUsize,
    active_decodes: AtomicUsize,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Scheduler {
    /// Creates a scheduler over the given client and transfer transport,
    /// registering any seed workers from the configuration.
    pub fn new(
        config: SchedulerConfig,
        client: Arc<dyn WorkerClient>,
        transport: Arc<dyn KvTransport>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new());
        let strategy = strategy::for_kind(config.strategy, config.weights.clone());
        let transfers = Arc::new(KvTransferManager::new(&config.kv_transfer, transport));
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            client.clone(),
            config.worker_timeout,
        ));

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                config,
                pool,
                strategy,
                client,
                transfers,
                monitor,
                queue: Mutex::new(VecDeque::new()),
                inflight: DashMap::new(),
                next_seq: AtomicU64::new(0),
                active_prefills: AtomicUsize::new(0),
                active_decodes: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        };

        for seed in scheduler.inner.config.workers.clone() {
            scheduler.register_worker(&seed);
        }

        scheduler
    }

    /// Starts the dispatch and health ticks. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.lock() = Some(token.clone());

        info!(
            strategy = self.inner.strategy.name(),
            dispatch_interval_ms = self.inner.config.dispatch_interval.as_millis() as u64,
            "scheduler started"
        );

        let inner = self.inner.clone();
        let dispatch_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.dispatch_interval);
            loop {
                tokio::select! {
                    () = dispatch_token.cancelled() => break,
                    _ = ticker.tick() => inner.dispatch_tick(),
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.health_check_interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => inner.monitor.tick().await,
                }
            }
        });
    }

    /// Stops the dispatch and health ticks; in-flight pipelines finish.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.inner.shutdown.lock().take() {
            token.cancel();
        }
        info!("scheduler stopped");
    }

    /// Admits a request into the queue.
    ///
    /// Rejects synchronously with [`SchedulerError::QueueFull`] when the
    /// queue is at capacity. The returned handle settles exactly once, with
    /// the completed result or the failure that ended the request.
    pub fn submit(&self, request: InferenceRequest) -> Result<ResponseHandle> {
        let inner = &self.inner;
        let mut queue = inner.queue.lock();

        if queue.len() >= inner.config.max_queue_size {
            return Err(SchedulerError::QueueFull {
                size: queue.len(),
                limit: inner.config.max_queue_size,
            });
        }

        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("req-{seq}");
        let timeout = request
            .timeout
            .unwrap_or(inner.config.default_request_timeout);
        let (tx, rx) = oneshot::channel();

        queue.push_back(QueuedEntry {
            request_id: request_id.clone(),
            seq,
            request,
            created_at: Instant::now(),
            timeout,
            resolver: tx,
        });

        // Emit before releasing the lock so a dispatch tick cannot start the
        // pipeline ahead of the queued event.
        inner.monitor.emit(EventKind::RequestQueued {
            request_id: request_id.clone(),
        });
        drop(queue);

        debug!(%request_id, "request queued");

        Ok(ResponseHandle { request_id, rx })
    }

    /// Registers a worker and announces it.
    pub fn register_worker(&self, seed: &WorkerSeed) -> Worker {
        let worker = self.inner.pool.register(seed);
        info!(worker_id = %worker.id, role = worker.role.as_str(), endpoint = %worker.endpoint, "worker registered");
        self.inner.monitor.emit(EventKind::WorkerOnline {
            worker_id: worker.id.clone(),
            role: worker.role,
        });
        worker
    }

    /// Marks a worker as draining; it finishes in-flight work but receives no
    /// new assignments.
    pub fn drain_worker(&self, id: &str) -> bool {
        self.inner.pool.drain(id)
    }

    /// Removes a worker from the pool.
    pub fn remove_worker(&self, id: &str) -> bool {
        self.inner.pool.remove(id)
    }

    /// The worker pool, for runtime registration and inspection.
    #[must_use]
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> SchedulerMetrics {
        let inner = &self.inner;
        inner.monitor.snapshot(
            inner.queue.lock().len(),
            inner.active_prefills.load(Ordering::Relaxed),
            inner.transfers.active(),
            inner.active_decodes.load(Ordering::Relaxed),
        )
    }

    /// The newest lifecycle events, up to `limit` (default 50).
    pub fn events(&self, limit: Option<usize>) -> Vec<SchedulerEvent> {
        self.inner.monitor.recent_events(limit)
    }

    /// Subscribes to the live event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.monitor.subscribe()
    }

    /// Returns true while the ticks are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl SchedulerInner {
    /// One dispatch pass: order the queue, expire stale entries, and move at
    /// most one request into the pipeline.
    ///
    /// Dispatching a single request per tick keeps per-tick latency bounded
    /// and lets freshly-arrived high-priority requests overtake older ones
    /// between ticks.
    fn dispatch_tick(self: &Arc<Self>) {
        let mut expired = Vec::new();
        let dispatched = {
            let mut queue = self.queue.lock();

            queue
                .make_contiguous()
                .sort_by_key(|e| (e.request.priority.rank(), e.created_at, e.seq));

            // Sweep expired entries tail-first so removal indices stay valid.
            let now = Instant::now();
            let mut index = queue.len();
            while index > 0 {
                index -= 1;
                if now.duration_since(queue[index].created_at) > queue[index].timeout {
                    if let Some(entry) = queue.remove(index) {
                        expired.push(entry);
                    }
                }
            }

            if queue.is_empty() {
                None
            } else {
                self.pool
                    .select(WorkerRole::Prefill, self.strategy.as_ref())
                    .and_then(|worker| queue.pop_front().map(|entry| (entry, worker)))
            }
        };

        for entry in expired {
            warn!(request_id = %entry.request_id, "request timed out in queue");
            self.settle_failure(
                entry.request_id,
                entry.resolver,
                SchedulerError::QueueTimeout {
                    waited_ms: entry.created_at.elapsed().as_millis() as u64,
                    limit_ms: entry.timeout.as_millis() as u64,
                },
            );
        }

        if let Some((entry, worker)) = dispatched {
            let QueuedEntry {
                request_id,
                request,
                created_at,
                resolver,
                ..
            } = entry;

            self.inflight.insert(request_id.clone(), InFlight { resolver });

            let active = ActiveRequest {
                request_id,
                request,
                created_at,
                phase: RequestPhase::Queued,
            };
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_pipeline(active, worker).await;
            });
        }
    }

    /// Drives one request through prefill, transfer, and decode.
    async fn run_pipeline(self: Arc<Self>, mut req: ActiveRequest, prefill_worker: Worker) {
        let request_id = req.request_id.clone();

        // Prefill.
        req.advance(RequestPhase::Prefilling);
        self.pool.increment_active(&prefill_worker.id);
        self.active_prefills.fetch_add(1, Ordering::Relaxed);
        self.monitor.emit(EventKind::PrefillStarted {
            request_id: request_id.clone(),
            worker_id: prefill_worker.id.clone(),
        });

        let prefill = self
            .client
            .prefill(
                &prefill_worker,
                &request_id,
                &req.request.prompt,
                &req.request.model_id,
            )
            .await;

        self.pool.decrement_active(&prefill_worker.id);
        self.active_prefills.fetch_sub(1, Ordering::Relaxed);

        let prefill = match prefill {
            Ok(outcome) => {
                self.monitor.emit(EventKind::PrefillCompleted {
                    request_id: request_id.clone(),
                    worker_id: prefill_worker.id.clone(),
                    latency_ms: outcome.latency_ms,
                });
                outcome
            }
            Err(error) => {
                req.advance(RequestPhase::Failed);
                self.fail(&request_id, SchedulerError::PrefillFailed(error));
                return;
            }
        };

        // Transfer. The prefill work is already spent, so a missing decode
        // worker fails the request rather than requeueing it.
        req.advance(RequestPhase::Transferring);
        let Some(decode_worker) = self.pool.select(WorkerRole::Decode, self.strategy.as_ref())
        else {
            req.advance(RequestPhase::Failed);
            self.fail(&request_id, SchedulerError::NoDecodeWorker);
            return;
        };

        self.monitor.emit(EventKind::TransferStarted {
            request_id: request_id.clone(),
            from: prefill_worker.id.clone(),
            to: decode_worker.id.clone(),
        });

        let transfer = self
            .transfers
            .transfer(TransferJob {
                request_id: request_id.clone(),
                source_endpoint: prefill_worker.endpoint.clone(),
                target_endpoint: decode_worker.endpoint.clone(),
                source_cache_handle: prefill.kv_cache_handle.clone(),
            })
            .await;

        if !transfer.success {
            req.advance(RequestPhase::Failed);
            let reason = transfer
                .error
                .unwrap_or_else(|| "unknown transfer failure".to_owned());
            self.fail(&request_id, SchedulerError::TransferFailed(reason));
            return;
        }

        self.monitor.emit(EventKind::TransferCompleted {
            request_id: request_id.clone(),
            duration_ms: transfer.transfer_duration_ms,
        });

        // Decode, against the imported cache when the transfer produced one.
        req.advance(RequestPhase::Decoding);
        let kv_cache_handle = transfer
            .target_cache_handle
            .unwrap_or_else(|| prefill.kv_cache_handle.clone());

        self.pool.increment_active(&decode_worker.id);
        self.active_decodes.fetch_add(1, Ordering::Relaxed);
        self.monitor.emit(EventKind::DecodeStarted {
            request_id: request_id.clone(),
            worker_id: decode_worker.id.clone(),
        });

        let decode = self
            .client
            .decode(
                &decode_worker,
                &request_id,
                &kv_cache_handle,
                &req.request.model_id,
                &req.request.sampling,
            )
            .await;

        self.pool.decrement_active(&decode_worker.id);
        self.active_decodes.fetch_sub(1, Ordering::Relaxed);

        let decode = match decode {
            Ok(outcome) => outcome,
            Err(error) => {
                req.advance(RequestPhase::Failed);
                self.fail(&request_id, SchedulerError::DecodeFailed(error));
                return;
            }
        };

        self.monitor.emit(EventKind::DecodeCompleted {
            request_id: request_id.clone(),
            worker_id: decode_worker.id.clone(),
            latency_ms: decode.latency_ms,
        });

        req.advance(RequestPhase::Completed);
        let total_latency_ms = req.created_at.elapsed().as_millis() as u64;
        self.monitor.emit(EventKind::RequestCompleted {
            request_id: request_id.clone(),
            total_latency_ms,
        });
        self.monitor
            .record_completion(total_latency_ms, prefill.latency_ms, decode.latency_ms);

        if let Some((_, entry)) = self.inflight.remove(&request_id) {
            let _ = entry.resolver.send(Ok(InferenceResponse {
                request_id,
                text: decode.text,
                prompt_tokens: prefill.prompt_tokens,
                completion_tokens: decode.completion_tokens,
                prefill_worker: prefill_worker.id,
                decode_worker: decode_worker.id,
                prefill_latency_ms: prefill.latency_ms,
                decode_latency_ms: decode.latency_ms,
                total_latency_ms,
            }));
        }
    }

    /// Fails an in-flight request. Unknown ids are a no-op, which makes the
    /// sink idempotent.
    fn fail(&self, request_id: &str, error: SchedulerError) {
        if let Some((_, entry)) = self.inflight.remove(request_id) {
            self.settle_failure(request_id.to_owned(), entry.resolver, error);
        }
    }

    /// Terminal failure path shared by the pipeline and the queue sweep.
    fn settle_failure(&self, request_id: String, resolver: Resolver, error: SchedulerError) {
        warn!(%request_id, %error, "request failed");
        self.monitor.record_failure();
        self.monitor.emit(EventKind::RequestFailed {
            request_id,
            error: error.to_string(),
        });
        let _ = resolver.send(Err(error));
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("workers", &self.inner.pool.len())
            .finish_non_exhaustive()
    }
}
