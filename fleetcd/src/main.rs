use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetcd::clients::{ControlPlane, GitSource, OmnictlClient};
use fleetcd::config::Args;
use fleetcd::{Controller, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("fleetcd={}", args.log_level)))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        repo = %args.git_repo,
        branch = %args.git_branch,
        endpoint = %args.omni_endpoint,
        "Starting fleetcd"
    );

    let store = Arc::new(StateStore::new(args.store_config()));
    match store.load().await {
        Ok(true) => info!(path = %args.state_file.display(), "Restored state"),
        Ok(false) => info!("No saved state, starting fresh"),
        Err(e) => warn!("Failed to load state, starting fresh: {}", e),
    }

    let client = Arc::new(OmnictlClient::with_binary(args.omnictl.clone()));
    if let Err(e) = client.check_connectivity().await {
        error!("Omni not reachable at startup: {}", e);
    }

    let source = Arc::new(GitSource::new(args.git_config()));
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        client,
        source,
        args.controller_config(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let loop_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };
    let readiness_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run_readiness(shutdown_rx).await })
    };

    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    let _ = readiness_handle.await;
    let _ = loop_handle.await;

    if let Err(e) = store.persist().await {
        warn!("Failed to persist state on shutdown: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
