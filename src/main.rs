//! Registrar daemon entry point.

use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod backend;
mod bridge;
mod config;
mod error;
mod event_loop;
mod extractor;
mod runtime;
mod store;
mod supervisor;
mod telemetry;
#[cfg(test)]
mod testing;
mod types;

use bridge::Bridge;
use config::{Cli, Config};
use event_loop::EventLoop;
use runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Arc::new(Config::load(Cli::parse())?);
    info!("Starting registrar {} ...", env!("CARGO_PKG_VERSION"));
    if let Some(ip) = &cfg.host_ip {
        info!("Forcing host IP to {}", ip);
    }

    // Collaborators
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let backend = backend::from_uri(&cfg.registry_uri)?;
    let telemetry = telemetry::from_config(&cfg);

    supervisor::establish(backend.as_ref(), cfg.retry_policy()).await?;

    // Subscribe before listing containers to avoid missing anything
    let (event_tx, event_rx) = mpsc::channel(cfg.event_buffer);
    let runtime_for_events = Arc::clone(&runtime);
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = runtime_for_events.monitor(event_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });

    let bridge = Arc::new(Bridge::new(
        runtime,
        backend,
        Arc::clone(&telemetry),
        Arc::clone(&cfg),
    ));
    if let Err(e) = bridge.sync(false).await {
        warn!("Initial sync failed: {}", e);
    }

    // Graceful Shutdown
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                shutdown_trigger.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    let result = EventLoop::new(bridge, cfg).run(event_rx, shutdown).await;
    monitor_handle.abort();
    telemetry.close().await;
    result?;

    info!("Shutdown complete.");
    Ok(())
}
