// ABOUTME: Daemon lifecycle - bind, seed and validate the registry, serve, shut down cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::daemon::server::{bind_socket, wait_for_shutdown, DaemonServer};
use crate::error::DaemonError;
use crate::git::WorktreeManager;
use crate::models::HealthState;
use crate::session::{FileSnapshotStore, TerminalRegistry};
use crate::tmux::SessionBackend;

/// Run a daemon until a `Shutdown` request or SIGINT/SIGTERM.
pub async fn run(config: DaemonConfig, backend: Arc<dyn SessionBackend>) -> Result<(), DaemonError> {
    // Bind first so a second daemon never touches the live one's snapshot
    let listener = bind_socket(&config.socket_path).await?;

    let store = Arc::new(FileSnapshotStore::new(&config.state_path));
    let registry = Arc::new(TerminalRegistry::load(store).await);
    let hook = Arc::new(WorktreeManager::from_config(&config));
    let server = DaemonServer::new(Arc::clone(&registry), backend, hook, config.naming());

    let reports = server.reconciler().reconcile_all().await;
    let missing = reports
        .iter()
        .filter(|r| r.state == HealthState::Missing)
        .count();
    let unknown = reports
        .iter()
        .filter(|r| r.state == HealthState::Unknown)
        .count();
    info!(
        "Validated {} seeded terminal(s): {} missing, {} unverifiable",
        reports.len(),
        missing,
        unknown
    );

    let mut tasks = Vec::new();
    if let Some(interval) = config.reconcile_interval() {
        tasks.push(Arc::clone(server.reconciler()).spawn_periodic(interval, server.shutdown_signal()));
    }
    tasks.push(spawn_flush(
        Arc::clone(&registry),
        config.snapshot_interval(),
        server.shutdown_signal(),
    ));
    let signals = spawn_signal_listener(server.clone());

    let served = server.serve(listener).await;

    signals.abort();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        debug!("Socket {} not removed: {}", config.socket_path.display(), e);
    }

    if let Err(e) = registry.flush().await {
        error!("Final snapshot failed: {}", e);
        return Err(e.into());
    }

    info!("Daemon shut down");
    served
}

/// Periodically write activity timestamps that `touch` left pending.
fn spawn_flush(
    registry: Arc<TerminalRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = registry.flush().await {
                        warn!("Failed to persist terminal snapshot, continuing in memory: {}", e);
                    }
                }
                () = wait_for_shutdown(&mut shutdown) => break,
            }
        }
    })
}

fn spawn_signal_listener(server: DaemonServer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, shutting down");
                    server.trigger_shutdown();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
        server.trigger_shutdown();
    })
}
