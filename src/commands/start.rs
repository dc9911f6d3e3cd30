use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use telemetry_bus::{config, init_server_tracing, server};
use tracing::info;

/// Execute the start command
///
/// Loads configuration, initializes tracing from it, then runs the server
/// until a shutdown signal arrives.
pub async fn execute(config_path: Option<PathBuf>) -> Result<()> {
    println!("{}", "Starting telemetry bus...".green());

    let cfg = config::load_config(config_path.as_deref())?;
    // Held until the server exits so queued file lines are flushed
    let _log_guards = init_server_tracing(&cfg.server.log_level, &cfg.server.log_format, &cfg.logging)?;

    info!(
        config = %config_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".to_string()),
        "Starting telemetry bus"
    );

    server::start_server(cfg, config_path).await
}
