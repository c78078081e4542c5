//! Shared harness for scheduler integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use kvflow_scheduler::{Scheduler, SchedulerConfig};

use self::fixtures::{StubKvTransport, StubWorkerClient};

/// A scheduler wired to scripted stubs with fast tick intervals.
pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub client: Arc<StubWorkerClient>,
    pub transport: Arc<StubKvTransport>,
}

impl TestScheduler {
    /// Harness with fast ticks and default transfer settings.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Harness over an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::build(config, StubKvTransport::new(Duration::ZERO))
    }

    /// Harness with a specific transfer transport.
    pub fn with_transport(config: SchedulerConfig, transport: StubKvTransport) -> Self {
        Self::build(config, transport)
    }

    fn build(config: SchedulerConfig, transport: StubKvTransport) -> Self {
        let client = Arc::new(StubWorkerClient::new());
        let transport = Arc::new(transport);
        let scheduler = Scheduler::new(config, client.clone(), transport.clone());
        Self {
            scheduler,
            client,
            transport,
        }
    }

    /// Event labels recorded for one request, in emission order.
    pub fn event_labels_for(&self, request_id: &str) -> Vec<&'static str> {
        self.scheduler
            .events(Some(1_000))
            .into_iter()
            .filter(|e| e.kind.request_id() == Some(request_id))
            .map(|e| e.kind.label())
            .collect()
    }

    /// Labels of all recorded events, in emission order.
    pub fn event_labels(&self) -> Vec<&'static str> {
        self.scheduler
            .events(Some(1_000))
            .into_iter()
            .map(|e| e.kind.label())
            .collect()
    }
}

/// Configuration with tick intervals fast enough for test sleeps.
pub fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.dispatch_interval = Duration::from_millis(10);
    config.health_check_interval = Duration::from_millis(20);
    config.worker_timeout = Duration::from_millis(150);
    config
}

/// Gives spawned pipelines and ticks time to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
