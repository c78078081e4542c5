//! Error types for the scheduler.

use thiserror::Error;

use crate::client::ClientError;

/// Scheduler errors.
///
/// Every submitted request settles with at most one of these; queue admission
/// rejects synchronously with [`SchedulerError::QueueFull`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Queue is at capacity; the request was not admitted.
    #[error("queue full: {size} requests queued (limit {limit})")]
    QueueFull { size: usize, limit: usize },

    /// Request aged past its timeout while still queued.
    #[error("request timed out after {waited_ms} ms in queue (limit {limit_ms} ms)")]
    QueueTimeout { waited_ms: u64, limit_ms: u64 },

    /// No decode-role worker was available at transfer time.
    #[error("no decode worker available")]
    NoDecodeWorker,

    /// The prefill call to the worker failed.
    #[error("prefill failed: {0}")]
    PrefillFailed(#[source] ClientError),

    /// The decode call to the worker failed.
    #[error("decode failed: {0}")]
    DecodeFailed(#[source] ClientError),

    /// The KV-cache transfer between workers failed.
    #[error("kv-cache transfer failed: {0}")]
    TransferFailed(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
