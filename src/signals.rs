use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{load_config, validate_thresholds};
use crate::observability::MetricsService;

/// Shutdown signal types
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Complete the buses, drain the writers, release sessions
    Graceful,
}

/// Setup signal handlers for the server
///
/// Handles:
/// - SIGTERM/SIGINT: graceful shutdown
/// - SIGHUP: reload the threshold table from the config file
#[cfg(unix)]
pub fn setup_signal_handlers(
    config_path: Option<PathBuf>,
    metrics: MetricsService,
) -> (broadcast::Sender<ShutdownSignal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        let streams = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        let (mut sigterm, mut sigint, mut sighup) = match streams {
            (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
            _ => {
                error!("Failed to install Unix signal handlers, falling back to Ctrl+C");
                wait_for_ctrl_c(&tx).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown");
                    let _ = tx.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown");
                    let _ = tx.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading thresholds");
                    match reload_thresholds(config_path.as_deref(), &metrics) {
                        Ok(count) => info!(count, "Thresholds reloaded"),
                        Err(e) => error!("Failed to reload thresholds, keeping current table: {:#}", e),
                    }
                }
            }
        }
    });

    (shutdown_tx, handle)
}

/// Only Ctrl+C is supported off Unix
#[cfg(not(unix))]
pub fn setup_signal_handlers(
    _config_path: Option<PathBuf>,
    _metrics: MetricsService,
) -> (broadcast::Sender<ShutdownSignal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx = shutdown_tx.clone();
    let handle = tokio::spawn(async move { wait_for_ctrl_c(&tx).await });
    (shutdown_tx, handle)
}

async fn wait_for_ctrl_c(tx: &broadcast::Sender<ShutdownSignal>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Ctrl+C received, initiating shutdown");
            let _ = tx.send(ShutdownSignal::Graceful);
        }
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

/// Re-read the config file and swap in its threshold table
///
/// The current table stays in place if loading or validation fails.
pub fn reload_thresholds(config_path: Option<&Path>, metrics: &MetricsService) -> Result<usize> {
    let config = load_config(config_path)?;
    validate_thresholds(&config.thresholds)?;

    let count = config.thresholds.len();
    metrics.set_thresholds(config.thresholds);
    Ok(count)
}
