//! Server mode — the Task Store API and the assignment-timeout reaper.

use std::sync::Arc;
use std::time::Duration;

use sandgrid_api::{AllowAll, Authorizer, StaticTokens};
use sandgrid_core::ServerConfig;
use sandgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run_server(config: &ServerConfig) -> anyhow::Result<()> {
    info!("sandgrid server starting");
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("tasks.redb");
    let store = StateStore::open(&db_path)?.with_dequeue_window(config.dequeue_window);
    info!(path = ?db_path, window = config.dequeue_window, "task store opened");

    let authorizer: Arc<dyn Authorizer> = if config.tokens.is_empty() {
        warn!("no tokens configured, every caller is allowed");
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticTokens::new(config.tokens.clone()))
    };

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Reaper ─────────────────────────────────────────────────

    let reaper_handle = tokio::spawn(reap_stale(
        store.clone(),
        config.reap_interval,
        config.assignment_timeout,
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────

    let router = sandgrid_api::build_router(store, authorizer);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reaper_handle.await;
    info!("sandgrid server stopped");
    Ok(())
}

/// Return tasks whose assignee went quiet to the queue.
async fn reap_stale(
    store: StateStore,
    every: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.unassign_stale(timeout) {
                    Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "stale assignments returned to queue"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reaper pass failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("reaper stopped");
}
