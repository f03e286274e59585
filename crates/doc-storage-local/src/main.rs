mod config;
mod engine;
mod lock;
mod metrics;
mod queue;
mod storage;
mod worker;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use engine::Engine;
use metrics::TracingMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting doc-storage-local merge service");
    info!("  Merge threshold: {}", config.merge_threshold);
    info!("  Workers: {}", config.merge_workers);

    let engine = Engine::open(config.engine_options(), Arc::new(TracingMetrics))?;
    info!("  Backend: {}", engine.factory().backend());
    info!("  Storage dir: {}", engine.factory().base_dir().display());
    let workspaces: Vec<&str> = engine.workspaces().collect();
    info!("  Workspaces: {}", workspaces.join(", "));

    let worker = Arc::new(engine.worker(config.merge_workers));
    worker.run(create_shutdown_signal()).await;

    info!("Shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
