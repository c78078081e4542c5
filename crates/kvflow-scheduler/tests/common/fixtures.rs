//! Scripted worker client and transfer transport for integration tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use kvflow_scheduler::client::{
    ClientError, DecodeOutcome, HealthProbe, PrefillOutcome, WorkerClient,
};
use kvflow_scheduler::pool::Worker;
use kvflow_scheduler::request::{Prompt, SamplingParams};
use kvflow_scheduler::transfer::KvTransport;
use kvflow_scheduler::{WorkerRole, WorkerSeed};

/// Builds a prefill worker seed.
pub fn prefill_seed(id: &str) -> WorkerSeed {
    seed(id, WorkerRole::Prefill)
}

/// Builds a decode worker seed.
pub fn decode_seed(id: &str) -> WorkerSeed {
    seed(id, WorkerRole::Decode)
}

fn seed(id: &str, role: WorkerRole) -> WorkerSeed {
    WorkerSeed {
        id: id.to_string(),
        endpoint: format!("http://{id}:8000"),
        role,
        model_id: "test-model".to_string(),
        max_concurrency: Some(8),
    }
}

/// Worker client stub with scripted outcomes.
///
/// Prefill returns a handle derived from the request id (`kv-<id>`), decode
/// returns `"ok"` with 4 completion tokens. Calls are recorded in arrival
/// order so tests can assert dispatch ordering.
pub struct StubWorkerClient {
    pub prefill_delay: Duration,
    pub decode_delay: Duration,
    pub fail_prefill: AtomicBool,
    pub fail_decode: AtomicBool,
    /// Worker ids whose probes report unhealthy, with the reported error.
    pub unhealthy: DashMap<String, String>,
    /// Request ids in prefill arrival order.
    pub prefill_calls: Mutex<Vec<String>>,
    /// (request id, kv-cache handle) in decode arrival order.
    pub decode_calls: Mutex<Vec<(String, String)>>,
}

impl StubWorkerClient {
    pub fn new() -> Self {
        Self {
            prefill_delay: Duration::ZERO,
            decode_delay: Duration::ZERO,
            fail_prefill: AtomicBool::new(false),
            fail_decode: AtomicBool::new(false),
            unhealthy: DashMap::new(),
            prefill_calls: Mutex::new(Vec::new()),
            decode_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_unhealthy(&self, worker_id: &str, error: &str) {
        self.unhealthy
            .insert(worker_id.to_string(), error.to_string());
    }

    pub fn mark_healthy(&self, worker_id: &str) {
        self.unhealthy.remove(worker_id);
    }
}

#[async_trait]
impl WorkerClient for StubWorkerClient {
    async fn prefill(
        &self,
        _worker: &Worker,
        request_id: &str,
        _prompt: &Prompt,
        _model_id: &str,
    ) -> Result<PrefillOutcome, ClientError> {
        self.prefill_calls.lock().push(request_id.to_string());
        tokio::time::sleep(self.prefill_delay).await;

        if self.fail_prefill.load(Ordering::SeqCst) {
            return Err(ClientError::Shape("stub prefill failure".to_string()));
        }

        Ok(PrefillOutcome {
            kv_cache_handle: format!("kv-{request_id}"),
            prompt_tokens: 2,
            latency_ms: 10,
        })
    }

    async fn decode(
        &self,
        _worker: &Worker,
        request_id: &str,
        kv_cache_handle: &str,
        _model_id: &str,
        _sampling: &SamplingParams,
    ) -> Result<DecodeOutcome, ClientError> {
        self.decode_calls
            .lock()
            .push((request_id.to_string(), kv_cache_handle.to_string()));
        tokio::time::sleep(self.decode_delay).await;

        if self.fail_decode.load(Ordering::SeqCst) {
            return Err(ClientError::Shape("stub decode failure".to_string()));
        }

        Ok(DecodeOutcome {
            text: "ok".to_string(),
            completion_tokens: 4,
            latency_ms: 20,
        })
    }

    async fn health(&self, worker: &Worker) -> HealthProbe {
        match self.unhealthy.get(&worker.id) {
            Some(error) => HealthProbe::unhealthy(error.clone()),
            None => HealthProbe {
                healthy: true,
                gpu_utilization: 0.25,
                active_requests: 0,
                error: None,
            },
        }
    }
}

/// Transfer transport stub that tracks concurrency.
pub struct StubKvTransport {
    pub delay: Duration,
    pub fail: AtomicBool,
    active: AtomicUsize,
    max_observed: AtomicUsize,
}

impl StubKvTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
        }
    }

    /// Highest number of transfers observed executing at once.
    pub fn max_observed(&self) -> usize {
        self.max_observed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvTransport for StubKvTransport {
    async fn export(&self, _endpoint: &str, cache_handle: &str) -> Result<String, ClientError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Shape("stub transfer refused".to_string()));
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(format!("{cache_handle}.tok"))
    }

    async fn import(
        &self,
        _endpoint: &str,
        transfer_token: &str,
        _source_worker: &str,
    ) -> Result<String, ClientError> {
        Ok(transfer_token.replace(".tok", ".imported"))
    }
}
