//! Command implementations for the CLI
//!
//! - start: run the server
//! - config: configuration display and validation
//! - logs / metrics: query the store directly, without a running server
//! - cleanup: run the retention pass now

pub mod cleanup;
pub mod config;
pub mod logs;
pub mod metrics;
pub mod start;

use anyhow::{Context, Result};
use std::path::Path;
use telemetry_bus::config::{load_config, Config};
use telemetry_bus::observability::SqliteStore;

/// Open the store named by the configuration
pub(crate) async fn open_store(config_path: Option<&Path>) -> Result<SqliteStore> {
    let cfg = load_config(config_path)?;
    connect_store(&cfg).await
}

pub(crate) async fn connect_store(cfg: &Config) -> Result<SqliteStore> {
    SqliteStore::connect(&cfg.storage.database_url)
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.storage.database_url))
}

/// `since` seconds before now, as a lower time bound
pub(crate) fn since_seconds(seconds: u64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() - chrono::Duration::seconds(seconds.min(i64::MAX as u64) as i64)
}
