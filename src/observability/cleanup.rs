//! Daily retention pass over the store

use chrono::{Datelike, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::store::{CleanupStats, SqliteStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Local hour of day (0-23) at which the pass runs
    pub cleanup_hour: u32,
    /// How often the clock is checked
    pub check_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_hour: 3,
            check_interval: Duration::from_secs(3600),
        }
    }
}

/// Run [`SqliteStore::cleanup_expired`] once a day at `config.cleanup_hour`
pub fn spawn_cleanup_task(store: Arc<SqliteStore>, config: CleanupConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.check_interval);
        let mut last_run: Option<u32> = None;

        loop {
            interval.tick().await;

            let now = chrono::Local::now();
            if !is_due(config.cleanup_hour, now.hour(), now.ordinal(), last_run) {
                continue;
            }

            tracing::info!(cleanup_hour = config.cleanup_hour, "Starting scheduled retention pass");
            match store.cleanup_expired().await {
                Ok(stats) => {
                    log_stats(&stats, "Retention pass completed");
                    last_run = Some(now.ordinal());
                }
                Err(e) => tracing::error!(error = %e, "Retention pass failed"),
            }
        }
    })
}

/// Run the retention pass immediately
pub async fn run_cleanup_now(store: &SqliteStore) -> Result<CleanupStats, StoreError> {
    tracing::info!("Running manual retention pass");
    let stats = store.cleanup_expired().await?;
    log_stats(&stats, "Manual retention pass completed");
    Ok(stats)
}

fn is_due(cleanup_hour: u32, hour: u32, day: u32, last_run: Option<u32>) -> bool {
    hour == cleanup_hour && last_run != Some(day)
}

fn log_stats(stats: &CleanupStats, message: &str) {
    tracing::info!(
        logs_deleted = stats.logs_deleted,
        metrics_deleted = stats.metrics_deleted,
        "{}",
        message
    );
}
