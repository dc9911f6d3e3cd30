use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::observability::threshold::{default_thresholds, MetricThreshold};

/// Default config file stem, resolved as `config.toml` in the working directory
pub const DEFAULT_CONFIG_NAME: &str = "config";

/// Environment variable prefix, e.g. `TELEMETRY_BUS__SERVER__PORT=8080`
pub const ENV_PREFIX: &str = "TELEMETRY_BUS";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<MetricThreshold>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            bus: BusConfig::default(),
            streaming: StreamingConfig::default(),
            collector: CollectorConfig::default(),
            logging: LoggingConfig::default(),
            thresholds: default_thresholds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_writer_capacity")]
    pub writer_capacity: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    /// Local hour of day (0-23) for the retention pass
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            writer_capacity: default_writer_capacity(),
            retention_days: default_retention_days(),
            cleanup_enabled: true,
            cleanup_hour: default_cleanup_hour(),
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Per-subscriber queue length before the oldest entries are dropped
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_historical_timeout_secs")]
    pub historical_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            historical_timeout_secs: default_historical_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

impl StreamingConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn historical_timeout(&self) -> Duration {
        Duration::from_secs(self.historical_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_collect_interval_secs")]
    pub interval_secs: u64,
    /// Host label for samples that carry none; defaults to the machine hostname
    #[serde(default)]
    pub host: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_collect_interval_secs(),
            host: None,
        }
    }
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Configured host label, else the machine hostname, else "localhost"
    pub fn resolved_host(&self) -> String {
        self.host
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// File sinks for forwarded log records (`error.log`, `combined.log`, `audit.log`)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub file_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// "daily", "hourly" or "never"
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: true,
            dir: default_log_dir(),
            rotation: default_log_rotation(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_rotation() -> String {
    "daily".to_string()
}
fn default_database_url() -> String {
    "sqlite:./data/telemetry.db".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_writer_capacity() -> usize {
    10_000
}
fn default_retention_days() -> u32 {
    7
}
fn default_cleanup_hour() -> u32 {
    3
}
fn default_subscriber_capacity() -> usize {
    1024
}
fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_historical_timeout_secs() -> u64 {
    15
}
fn default_keepalive_secs() -> u64 {
    15
}
fn default_stats_log_interval_secs() -> u64 {
    300
}
fn default_collect_interval_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

/// Load configuration from `path` (required) or from `config.toml` if present,
/// then overlay `TELEMETRY_BUS__*` environment variables
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
    };

    let config = config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    match cfg.server.log_format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!("Invalid log format '{}', expected 'pretty' or 'json'", other),
    }

    match cfg.logging.rotation.as_str() {
        "daily" | "hourly" | "never" => {}
        other => anyhow::bail!(
            "Invalid logging.rotation '{}', expected 'daily', 'hourly' or 'never'",
            other
        ),
    }
    if cfg.logging.file_enabled && cfg.logging.dir.as_os_str().is_empty() {
        anyhow::bail!("logging.dir cannot be empty when file logging is enabled");
    }

    if cfg.storage.database_url.is_empty() {
        anyhow::bail!("storage.database_url cannot be empty");
    }
    if cfg.storage.batch_size == 0 {
        anyhow::bail!("storage.batch_size must be greater than 0");
    }
    if cfg.storage.flush_interval_ms == 0 {
        anyhow::bail!("storage.flush_interval_ms must be greater than 0");
    }
    if cfg.storage.writer_capacity == 0 {
        anyhow::bail!("storage.writer_capacity must be greater than 0");
    }
    if cfg.storage.retention_days == 0 {
        anyhow::bail!("storage.retention_days must be greater than 0");
    }
    if cfg.storage.cleanup_hour > 23 {
        anyhow::bail!("storage.cleanup_hour must be between 0 and 23");
    }

    if cfg.bus.subscriber_capacity == 0 {
        anyhow::bail!("bus.subscriber_capacity must be greater than 0");
    }

    let streaming = &cfg.streaming;
    for (name, value) in [
        ("reconcile_interval_secs", streaming.reconcile_interval_secs),
        ("historical_timeout_secs", streaming.historical_timeout_secs),
        ("keepalive_secs", streaming.keepalive_secs),
        ("stats_log_interval_secs", streaming.stats_log_interval_secs),
    ] {
        if value == 0 {
            anyhow::bail!("streaming.{} must be greater than 0", name);
        }
    }

    if cfg.collector.interval_secs == 0 {
        anyhow::bail!("collector.interval_secs must be greater than 0");
    }

    validate_thresholds(&cfg.thresholds)?;

    Ok(())
}

/// Reject bounds that are not finite or where warning exceeds critical
pub fn validate_thresholds(thresholds: &[MetricThreshold]) -> anyhow::Result<()> {
    for t in thresholds {
        if !t.warning_threshold.is_finite() || !t.critical_threshold.is_finite() {
            anyhow::bail!("Threshold for '{}' must be a finite number", t.metric_type);
        }
        if t.warning_threshold > t.critical_threshold {
            anyhow::bail!(
                "Threshold for '{}' has warning ({}) above critical ({})",
                t.metric_type,
                t.warning_threshold,
                t.critical_threshold
            );
        }
    }
    Ok(())
}
