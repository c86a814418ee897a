//! Foreman mode — wire the loop to the Task Store, the observer and the
//! container runtime of this machine.

use std::sync::Arc;

use sandgrid_core::{ForemanConfig, LauncherKind};
use sandgrid_foreman::{
    AttachWrapper, ContainerLauncher, DockerImages, DockerLauncher, Foreman, GpuInventory, HttpTaskStore,
    NvidiaSmi, ObserverMonitor, ProcessLauncher, TaskRunner, TaskStore, machine_capacity,
};
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run_foreman(config: &ForemanConfig) -> anyhow::Result<()> {
    info!(server = %config.server, launcher = ?config.launcher, "sandgrid foreman starting");
    std::fs::create_dir_all(&config.temp_path)?;

    let store: Arc<dyn TaskStore> =
        Arc::new(HttpTaskStore::new(&config.server, config.token.clone())?);
    let gpus: Arc<dyn GpuInventory> = Arc::new(NvidiaSmi);
    let inventory = gpus.gpus().await;
    let capacity = machine_capacity(&config.limits, &inventory);
    info!(gpus = inventory.len(), ?capacity, "machine capacity");

    let launcher: Arc<dyn ContainerLauncher> = match config.launcher {
        LauncherKind::Docker => Arc::new(DockerLauncher::new(config.docker.clone())),
        LauncherKind::Process => Arc::new(ProcessLauncher),
    };
    let runner = TaskRunner::new(
        store.clone(),
        launcher,
        Arc::new(ObserverMonitor::new(config.observer_socket.clone())),
        gpus,
        config.temp_path.clone(),
        config.tags.clone(),
    )
    .with_attacher(AttachWrapper::run_attached(std::env::current_exe()?));
    let mut foreman = Foreman::new(config.clone(), capacity, store, runner);
    if config.launcher == LauncherKind::Docker {
        foreman = foreman.with_images(Arc::new(DockerImages::new(config.docker.clone())));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
        }
        info!("shutdown signal received, finishing current batch");
        let _ = shutdown_tx.send(true);
    });

    foreman.run(shutdown_rx).await;
    Ok(())
}
