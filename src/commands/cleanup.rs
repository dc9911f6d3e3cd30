use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use telemetry_bus::config::load_config;
use telemetry_bus::observability::store::CleanupStats;
use telemetry_bus::observability::{run_cleanup_now, SqliteStore};

/// Execute the cleanup command
///
/// Applies the configured retention to both tables and deletes expired rows
/// immediately instead of waiting for the scheduled pass.
pub async fn execute(config_path: Option<&Path>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let store = super::connect_store(&cfg).await?;

    println!(
        "{}",
        format!("Removing records older than {} days...", cfg.storage.retention_days).yellow()
    );
    let stats = purge(&store, cfg.storage.retention_days).await?;

    println!("{}", "✓ Retention pass completed".green());
    println!("  Logs deleted:    {}", stats.logs_deleted);
    println!("  Metrics deleted: {}", stats.metrics_deleted);
    Ok(())
}

async fn purge(store: &SqliteStore, retention_days: u32) -> Result<CleanupStats> {
    for table in ["logs", "metrics"] {
        store.set_retention(table, retention_days).await?;
    }
    Ok(run_cleanup_now(store).await?)
}
