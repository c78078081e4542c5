//! kvflow scheduler binary.
//!
//! Loads configuration, registers seed workers, and runs the scheduler until
//! interrupted.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvflow_scheduler::{HttpKvTransport, HttpWorkerClient, Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kvflow_scheduler=info".parse()?),
        )
        .init();

    info!("kvflow scheduler starting");

    // Load configuration
    let config: SchedulerConfig = Figment::new()
        .merge(Toml::file("kvflow.toml"))
        .merge(Env::prefixed("KVFLOW_").split("__"))
        .extract()?;

    if !config.enabled {
        info!("scheduler disabled by configuration, exiting");
        return Ok(());
    }

    info!(
        seed_workers = config.workers.len(),
        max_queue_size = config.max_queue_size,
        "configuration loaded"
    );

    let client = Arc::new(HttpWorkerClient::new(&config.client)?);
    let scheduler = Scheduler::new(config, client, Arc::new(HttpKvTransport::new()));
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    scheduler.stop();

    Ok(())
}
