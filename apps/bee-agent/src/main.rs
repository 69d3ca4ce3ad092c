//! # Bee Agent
//!
//! Device daemon that runs the sync engine until it is told to stop.
//!
//! ## Usage
//! ```text
//! bee-agent [CONFIG_PATH]
//!
//! RUST_LOG=bee_sync=trace bee-agent /etc/bee/sync.toml
//! ```
//!
//! Without a path the platform config directory is searched. Every setting
//! can also be overridden through `BEE_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;

use bee_sync::{
    BroadcastEmitter, LinkMonitor, SyncConfig, SyncEngine, SyncEvent, TomlSettingsStore,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SyncConfig::load_or_default(config_path.clone());
    info!(
        device_id = %config.device.id,
        server = %config.server.url,
        interface = %config.network.interface,
        "Starting Bee agent"
    );

    let (link, link_task) = LinkMonitor::from_config(&config).spawn().await;
    let (emitter, mut events) = BroadcastEmitter::new(64);

    let (engine, handle) = SyncEngine::builder(config)
        .with_link(link)
        .with_settings_store(Arc::new(TomlSettingsStore::new(config_path)))
        .with_emitter(Arc::new(emitter))
        .build()?;
    let engine_task = engine.spawn();

    let mut status = handle.watch_status();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                debug!(
                    connection = %snapshot.connection,
                    syncing = snapshot.is_syncing(),
                    ready = snapshot.is_ready(),
                    assets = snapshot.media.asset_count,
                    "Sync status changed"
                );
            }
            _ = &mut shutdown => {
                if let Err(e) = handle.shutdown().await {
                    warn!(error = %e, "Engine was already stopped");
                }
                break;
            }
        }
    }

    if let Err(e) = engine_task.await {
        error!(error = %e, "Sync engine task failed");
    }
    link_task.abort();

    info!("Bee agent stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=bee_sync=trace` - Show trace for the sync engine only
/// - Default: INFO, DEBUG for bee crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bee_sync=debug,bee_agent=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::MediaSyncFailed(reason) => warn!(%reason, "Media sync failed"),
        SyncEvent::StartupCompleted(domain) => info!(%domain, "Startup check completed"),
        other => info!(event = ?other, "Sync event"),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, stopping sync engine...");
}
