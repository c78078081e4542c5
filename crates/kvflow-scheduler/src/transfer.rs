//! Bounded-concurrency KV-cache transfer orchestration.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::client::ClientError;
use crate::config::KvTransferConfig;
use crate::protocol::{KvExportRequest, KvExportResponse, KvImportRequest, KvImportResponse};

/// A KV-cache movement from a prefill worker to a decode worker.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub request_id: String,
    pub source_endpoint: String,
    pub target_endpoint: String,
    pub source_cache_handle: String,
}

/// Outcome of a transfer. Failures are encoded here rather than raised, so
/// transport faults never unwind into the scheduler.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub success: bool,
    pub transfer_duration_ms: u64,
    pub target_cache_handle: Option<String>,
    pub error: Option<String>,
}

impl TransferResult {
    fn completed(duration: Duration, target_cache_handle: String) -> Self {
        Self {
            success: true,
            transfer_duration_ms: duration.as_millis() as u64,
            target_cache_handle: Some(target_cache_handle),
            error: None,
        }
    }

    fn failed(duration: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            transfer_duration_ms: duration.as_millis() as u64,
            target_cache_handle: None,
            error: Some(error.into()),
        }
    }
}

/// Transport performing the two-call export/import sequence.
#[async_trait]
pub trait KvTransport: Send + Sync {
    /// Asks the source worker to export a cache; returns the transfer token.
    async fn export(&self, endpoint: &str, cache_handle: &str) -> Result<String, ClientError>;

    /// Asks the target worker to import from the token; returns the handle of
    /// the imported cache on the target.
    async fn import(
        &self,
        endpoint: &str,
        transfer_token: &str,
        source_worker: &str,
    ) -> Result<String, ClientError>;
}

/// HTTP transport against the workers' `/kv_cache` endpoints.
#[derive(Debug, Clone, Default)]
pub struct HttpKvTransport {
    http: reqwest::Client,
}

impl HttpKvTransport {
    #[must_use]
    pub fn new() -> Self {
        // Per-call pacing comes from the manager's transfer deadline.
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl KvTransport for HttpKvTransport {
    async fn export(&self, endpoint: &str, cache_handle: &str) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{endpoint}/kv_cache/export"))
            .json(&KvExportRequest {
                cache_handle: cache_handle.to_owned(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let body: KvExportResponse = response.json().await?;
        Ok(body.transfer_token)
    }

    async fn import(
        &self,
        endpoint: &str,
        transfer_token: &str,
        source_worker: &str,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{endpoint}/kv_cache/import"))
            .json(&KvImportRequest {
                transfer_token: transfer_token.to_owned(),
                source_worker: source_worker.to_owned(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let body: KvImportResponse = response.json().await?;
        Ok(body.cache_handle)
    }
}

/// Transfer orchestrator enforcing a concurrency cap with FIFO overflow.
///
/// At most `max_concurrent` transfers execute at once; the rest wait on the
/// semaphore, which hands out permits in arrival order.
pub struct KvTransferManager {
    transport: Arc<dyn KvTransport>,
    slots: Arc<Semaphore>,
    timeout: Duration,
    active: AtomicUsize,
}

impl KvTransferManager {
    /// Creates a manager over the given transport.
    pub fn new(config: &KvTransferConfig, transport: Arc<dyn KvTransport>) -> Self {
        Self {
            transport,
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            timeout: config.timeout,
            active: AtomicUsize::new(0),
        }
    }

    /// Number of transfers currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Runs a transfer, waiting for a free slot if the cap is reached.
    ///
    /// The deadline covers the export and import calls together. Never
    /// returns an error; inspect [`TransferResult::success`].
    pub async fn transfer(&self, job: TransferJob) -> TransferResult {
        let queued_at = Instant::now();
        let Ok(_permit) = self.slots.acquire().await else {
            return TransferResult::failed(queued_at.elapsed(), "transfer manager shut down");
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        debug!(request_id = %job.request_id, from = %job.source_endpoint, to = %job.target_endpoint, "transfer started");

        let outcome = tokio::time::timeout(self.timeout, self.do_transfer(&job)).await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(target_cache_handle)) => TransferResult::completed(elapsed, target_cache_handle),
            Ok(Err(error)) => TransferResult::failed(elapsed, error.to_string()),
            Err(_) => TransferResult::failed(
                elapsed,
                format!("transfer deadline exceeded after {} ms", self.timeout.as_millis()),
            ),
        }
    }

    async fn do_transfer(&self, job: &TransferJob) -> Result<String, ClientError> {
        let token = self
            .transport
            .export(&job.source_endpoint, &job.source_cache_handle)
            .await?;
        // The import payload names the source by endpoint, matching worker
        // behaviour.
        self.transport
            .import(&job.target_endpoint, &token, &job.source_endpoint)
            .await
    }
}

impl std::fmt::Debug for KvTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTransferManager")
            .field("timeout", &self.timeout)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
