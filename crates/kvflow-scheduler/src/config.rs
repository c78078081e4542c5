//! Configuration types for the scheduler.

use serde::Deserialize;
use std::time::Duration;

use crate::pool::WorkerRole;

/// Scheduler configuration.
///
/// All intervals are expressed in milliseconds in configuration files; the
/// worker contract itself speaks milliseconds throughout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler is enabled at all (binary only; the library
    /// ignores this).
    pub enabled: bool,
    /// Worker selection strategy.
    pub strategy: StrategyKind,
    /// Interval between dispatch ticks.
    #[serde(with = "serde_duration_ms")]
    pub dispatch_interval: Duration,
    /// Interval between health probe ticks.
    #[serde(with = "serde_duration_ms")]
    pub health_check_interval: Duration,
    /// Time since last successful probe before a worker is considered stale.
    #[serde(with = "serde_duration_ms")]
    pub worker_timeout: Duration,
    /// Maximum number of queued requests before admission rejects.
    pub max_queue_size: usize,
    /// Queue timeout applied to requests that do not carry their own.
    #[serde(with = "serde_duration_ms")]
    pub default_request_timeout: Duration,
    /// Workers registered at startup.
    pub workers: Vec<WorkerSeed>,
    /// KV-cache transfer settings.
    pub kv_transfer: KvTransferConfig,
    /// Worker client settings.
    pub client: ClientConfig,
    /// Scoring weights for the weighted strategy.
    pub weights: SelectionWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: StrategyKind::LeastLoaded,
            dispatch_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(10_000),
            worker_timeout: Duration::from_millis(30_000),
            max_queue_size: 1_000,
            default_request_timeout: Duration::from_millis(60_000),
            workers: Vec::new(),
            kv_transfer: KvTransferConfig::default(),
            client: ClientConfig::default(),
            weights: SelectionWeights::default(),
        }
    }
}

/// Worker selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rotate through candidates with a per-role counter.
    RoundRobin,
    /// Pick the candidate with the fewest active requests.
    LeastLoaded,
    /// Pick the candidate with the lowest GPU utilisation.
    LatencyAware,
    /// Score candidates by load, utilisation, and probe staleness.
    Weighted,
}

/// Seed describing a worker to register.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSeed {
    /// Unique worker identifier.
    pub id: String,
    /// Opaque worker address, e.g. `http://10.0.0.7:8000`.
    pub endpoint: String,
    /// Pool the worker serves.
    pub role: WorkerRole,
    /// Model the worker hosts.
    pub model_id: String,
    /// Maximum concurrent requests; defaults to 32 when unset.
    pub max_concurrency: Option<u32>,
}

/// KV-cache transfer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KvTransferConfig {
    /// Maximum transfers executing at once; overflow waits FIFO.
    pub max_concurrent: usize,
    /// Deadline covering the export/import sequence of one transfer.
    #[serde(with = "serde_duration_ms")]
    pub timeout: Duration,
}

impl Default for KvTransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout: Duration::from_millis(15_000),
        }
    }
}

/// Worker client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call deadline for worker HTTP requests.
    #[serde(with = "serde_duration_ms")]
    pub request_timeout: Duration,
    /// Retry `/completions` when a worker answers 404 on the primary paths.
    pub legacy_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
            legacy_fallback: true,
        }
    }
}

/// Scoring weights for [`StrategyKind::Weighted`].
///
/// Lower scores win; each term is weighted and summed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    /// Weight on `active_requests`.
    pub load: f64,
    /// Weight on `gpu_utilization`.
    pub utilization: f64,
    /// Weight on seconds since the last successful probe.
    pub staleness: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            load: 0.5,
            utilization: 0.3,
            staleness: 0.2,
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
