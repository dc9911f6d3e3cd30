//! Tracing subscriber setup
//!
//! The console layer follows `RUST_LOG`, falling back to the configured
//! level. File sinks carry fixed levels of their own and write JSON lines:
//! - `error.log`: ERROR from every target
//! - `combined.log`: INFO and above from every target
//! - `audit.log`: audit entries, forwarded under [`AUDIT_TARGET`]

use anyhow::Context;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Target of every forwarded log record
pub const FORWARD_TARGET: &str = "telemetry";
/// Target of forwarded audit entries
pub const AUDIT_TARGET: &str = "telemetry::audit";

pub const ERROR_LOG: &str = "error.log";
pub const COMBINED_LOG: &str = "combined.log";
pub const AUDIT_LOG: &str = "audit.log";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Background file writers; records still queued are flushed on drop
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

fn console_layer<S>(level: &str, format: &str) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format == "json" {
        fmt::layer().json().with_target(true).with_filter(filter).boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    }
}

fn rotation(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn file_sink(cfg: &LoggingConfig, file_name: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(rotation(&cfg.rotation))
        .filename_prefix(file_name)
        .build(&cfg.dir)
        .with_context(|| format!("Failed to open {} in {}", file_name, cfg.dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSON layers for the three log files under `cfg.dir`
pub fn file_layers<S>(cfg: &LoggingConfig) -> anyhow::Result<(Vec<BoxedLayer<S>>, LogGuards)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::fs::create_dir_all(&cfg.dir)
        .with_context(|| format!("Failed to create log directory {}", cfg.dir.display()))?;

    let sinks = [
        (ERROR_LOG, Targets::new().with_default(Level::ERROR)),
        (COMBINED_LOG, Targets::new().with_default(Level::INFO)),
        (AUDIT_LOG, Targets::new().with_target(AUDIT_TARGET, Level::TRACE)),
    ];

    let mut layers = Vec::with_capacity(sinks.len());
    let mut guards = Vec::with_capacity(sinks.len());
    for (file_name, filter) in sinks {
        let (writer, guard) = file_sink(cfg, file_name)?;
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        );
        guards.push(guard);
    }

    Ok((layers, LogGuards { _guards: guards }))
}

fn install(layers: Vec<BoxedLayer<Registry>>) {
    if let Err(e) = tracing_subscriber::registry().with(layers).try_init() {
        eprintln!("Warning: tracing already initialized: {}", e);
    }
}

/// Console-only tracing for CLI commands
///
/// `RUST_LOG` wins over `level` when set. `format` is "json" or "pretty".
/// Only the first call installs a subscriber.
pub fn init_tracing(level: &str, format: &str) {
    install(vec![console_layer(level, format)]);
}

/// Console plus the configured file sinks, for the server
pub fn init_server_tracing(level: &str, format: &str, cfg: &LoggingConfig) -> anyhow::Result<Option<LogGuards>> {
    let mut layers = vec![console_layer(level, format)];
    let guards = if cfg.file_enabled {
        let (files, guards) = file_layers(cfg)?;
        layers.extend(files);
        Some(guards)
    } else {
        None
    };

    install(layers);
    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{AuditInfo, Hub, HubOptions, LogLevel, SqliteStore};
    use std::sync::Arc;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("daily"), Rotation::DAILY);
    }

    #[tokio::test]
    async fn test_forwarded_logs_reach_file_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoggingConfig {
            file_enabled: true,
            dir: dir.path().join("logs"),
            rotation: "never".to_string(),
        };
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let hub = Hub::with_stores(store.clone(), store, HubOptions::default());

        let (layers, guards) = file_layers::<Registry>(&cfg).unwrap();
        let subscriber = tracing_subscriber::registry().with(layers);
        tracing::subscriber::with_default(subscriber, || {
            hub.logs.debug("cache warmed", Some("Cache"));
            hub.logs.info("user signed in", Some("Auth"));
            hub.logs.error("disk failure", Some("Disk"));
            hub.logs.audit(
                "role granted",
                LogLevel::Info,
                Some("admin"),
                AuditInfo {
                    user_id: Some("u-1".to_string()),
                    ..Default::default()
                },
                None,
            );
        });
        drop(guards);

        let read = |name: &str| std::fs::read_to_string(cfg.dir.join(name)).unwrap();

        let errors = read(ERROR_LOG);
        assert!(errors.contains("disk failure"));
        assert!(!errors.contains("user signed in"));

        let combined = read(COMBINED_LOG);
        assert!(combined.contains("user signed in"));
        assert!(combined.contains("disk failure"));
        assert!(combined.contains("role granted"));
        assert!(!combined.contains("cache warmed"));

        let audit = read(AUDIT_LOG);
        assert!(audit.contains("role granted"));
        assert!(audit.contains("u-1"));
        assert!(!audit.contains("disk failure"));
        assert!(!audit.contains("user signed in"));
    }
}
