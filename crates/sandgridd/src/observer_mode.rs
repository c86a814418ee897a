//! Observer mode — cgroup sessions served over a Unix socket.

use std::sync::Arc;

use sandgrid_core::ObserverConfig;
use sandgrid_observer::{ControlGroupSystem, HostKernel, ObserverServer, SessionRegistry};
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run_observer(config: &ObserverConfig) -> anyhow::Result<()> {
    info!("sandgrid observer starting");
    let system = ControlGroupSystem::discover(Arc::new(HostKernel))?;
    let registry = Arc::new(SessionRegistry::new(system, config.stats_retention));
    let server = ObserverServer::new(registry, config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}
