//! kvflow scheduler - dynamic request scheduling for disaggregated LLM
//! inference.
//!
//! In disaggregated serving the prefill phase (compute-bound prompt
//! ingestion) and the decode phase (bandwidth-bound token emission) run on
//! separate GPU worker pools, connected by an explicit KV-cache transfer.
//! This crate is the scheduling core that sits between them:
//!
//! - **Worker pool**: registry of prefill/decode workers with pluggable
//!   selection strategies
//! - **Scheduler**: priority queue admission, dispatch ticks, and the
//!   three-phase request pipeline
//! - **KV transfer manager**: bounded-concurrency cache movement with FIFO
//!   overflow
//! - **Health monitor**: periodic probes, stale-worker eviction, rolling
//!   latency windows, and the lifecycle event log
//! - **Worker client**: the narrow contract to remote workers, injectable
//!   for tests and HTTP-backed in production
//!
//! # Example
//!
//! ```ignore
//! use kvflow_scheduler::{
//!     HttpKvTransport, HttpWorkerClient, InferenceRequest, Scheduler, SchedulerConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = SchedulerConfig::default();
//! let client = Arc::new(HttpWorkerClient::new(&config.client)?);
//! let scheduler = Scheduler::new(config, client, Arc::new(HttpKvTransport::new()));
//! scheduler.start();
//!
//! let handle = scheduler.submit(InferenceRequest::new("llama-3-70b", "Hello"))?;
//! let response = handle.recv().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod strategy;
pub mod transfer;

// Re-export main types
pub use client::{ClientError, DecodeOutcome, HealthProbe, HttpWorkerClient, PrefillOutcome, WorkerClient};
pub use config::{ClientConfig, KvTransferConfig, SchedulerConfig, SelectionWeights, StrategyKind, WorkerSeed};
pub use error::{Result, SchedulerError};
pub use events::{EventKind, SchedulerEvent};
pub use health::{HealthMonitor, LatencyWindow, SchedulerMetrics, WorkerSnapshot};
pub use pool::{Worker, WorkerId, WorkerPool, WorkerRole, WorkerStatus};
pub use request::{
    InferenceRequest, InferenceResponse, Priority, Prompt, RequestPhase, ResponseHandle,
    SamplingParams,
};
pub use scheduler::Scheduler;
pub use strategy::{LatencyAware, LeastLoaded, RoundRobin, SelectionStrategy, Weighted};
pub use transfer::{HttpKvTransport, KvTransferManager, KvTransport, TransferJob, TransferResult};
