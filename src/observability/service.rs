//! Log and metric services over the live buses
//!
//! [`Hub`] is built once at startup and shut down once at exit. It owns both
//! buses, their stores, the threshold monitor and the session registries, and
//! is handed to the HTTP layer as shared state.

use std::sync::Arc;
use tokio::task::JoinHandle;

use super::bus::{LiveBus, Subscription};
use super::cleanup::{spawn_cleanup_task, CleanupConfig};
use super::collector::spawn_system_collector;
use super::filter::{LogFilter, MetricFilter};
use super::record::{AuditInfo, LogLevel, LogRecord, MetricRecord, Payload};
use super::session::SessionRegistry;
use super::store::{EventStore, SqliteStore, StoreError};
use super::threshold::{MetricThreshold, ThresholdMonitor};
use super::writer::{AsyncWriter, WriterConfig};
use crate::config::Config;
use crate::logging::{AUDIT_TARGET, FORWARD_TARGET};

// ============================================================================
// Logs
// ============================================================================

/// Structured logging entry point
#[derive(Clone)]
pub struct LogService {
    bus: LiveBus<LogRecord>,
    store: Arc<dyn EventStore<LogRecord>>,
}

impl LogService {
    pub fn new(bus: LiveBus<LogRecord>, store: Arc<dyn EventStore<LogRecord>>) -> Self {
        Self { bus, store }
    }

    pub fn bus(&self) -> &LiveBus<LogRecord> {
        &self.bus
    }

    /// Publish a fully built record and echo it to the process log
    pub fn publish(&self, record: LogRecord) -> Arc<LogRecord> {
        let record = self.bus.publish(record);
        forward_to_tracing(&record);
        record
    }

    fn emit(&self, level: LogLevel, message: Payload, context: Option<&str>) -> Arc<LogRecord> {
        let mut record = LogRecord::new(level, message);
        record.context = context.map(str::to_string);
        self.publish(record)
    }

    pub fn debug(&self, message: impl Into<Payload>, context: Option<&str>) -> Arc<LogRecord> {
        self.emit(LogLevel::Debug, message.into(), context)
    }

    pub fn info(&self, message: impl Into<Payload>, context: Option<&str>) -> Arc<LogRecord> {
        self.emit(LogLevel::Info, message.into(), context)
    }

    pub fn log(&self, message: impl Into<Payload>, context: Option<&str>) -> Arc<LogRecord> {
        self.emit(LogLevel::Log, message.into(), context)
    }

    pub fn warn(&self, message: impl Into<Payload>, context: Option<&str>) -> Arc<LogRecord> {
        self.emit(LogLevel::Warn, message.into(), context)
    }

    pub fn error(&self, message: impl Into<Payload>, context: Option<&str>) -> Arc<LogRecord> {
        self.emit(LogLevel::Error, message.into(), context)
    }

    /// ERROR record carrying an error and its source chain as the trace
    pub fn exception(&self, error: &(dyn std::error::Error + 'static), context: Option<&str>) -> Arc<LogRecord> {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        let trace = (!chain.is_empty()).then(|| chain.join("\n"));
        self.emit(LogLevel::Error, Payload::error(error.to_string(), trace), context)
    }

    /// Publish an audit trail entry
    pub fn audit(
        &self,
        message: impl Into<Payload>,
        level: LogLevel,
        context: Option<&str>,
        audit: AuditInfo,
        additional_info: Option<serde_json::Value>,
    ) -> Arc<LogRecord> {
        let mut record = LogRecord::new(level, message).with_audit(audit);
        record.context = context.map(str::to_string);
        record.additional_info = additional_info;
        self.publish(record)
    }

    /// Live records from now on
    pub fn stream(&self, filter: LogFilter) -> Subscription<LogRecord> {
        self.bus.subscribe(filter)
    }

    pub async fn query(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        self.store.query(filter).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<LogRecord, StoreError> {
        self.store.get_by_id(id).await
    }
}

/// Echo a published record to the tracing subscriber at the matching level
/// Emit at the tracing level matching a record's level
macro_rules! forward {
    ($level:expr, target: $target:expr, $($fields:tt)+) => {
        match $level {
            LogLevel::Debug => tracing::debug!(target: $target, $($fields)+),
            LogLevel::Info | LogLevel::Log => tracing::info!(target: $target, $($fields)+),
            LogLevel::Warn => tracing::warn!(target: $target, $($fields)+),
            LogLevel::Error => tracing::error!(target: $target, $($fields)+),
        }
    };
}

fn forward_to_tracing(record: &LogRecord) {
    let context = record.context.as_deref().unwrap_or("-");
    let message = record.message.render();
    let id = record.id.as_deref().unwrap_or("-");

    match &record.audit {
        Some(audit) => {
            let user_id = audit.user_id.as_deref().unwrap_or("-");
            let action = audit.action.as_deref().unwrap_or("-");
            let status = audit.status.as_ref().map(|s| s.as_str()).unwrap_or("-");
            forward!(record.level, target: AUDIT_TARGET, context, id, user_id, action, status, "{}", message)
        }
        None => forward!(record.level, target: FORWARD_TARGET, context, id, "{}", message),
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Metric recording, streaming and threshold evaluation
#[derive(Clone)]
pub struct MetricsService {
    bus: LiveBus<MetricRecord>,
    store: Arc<dyn EventStore<MetricRecord>>,
    thresholds: Arc<ThresholdMonitor>,
    logs: LogService,
    default_host: Arc<str>,
}

impl MetricsService {
    pub fn new(
        bus: LiveBus<MetricRecord>,
        store: Arc<dyn EventStore<MetricRecord>>,
        thresholds: Arc<ThresholdMonitor>,
        logs: LogService,
        default_host: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            bus,
            store,
            thresholds,
            logs,
            default_host: default_host.into(),
        }
    }

    pub fn bus(&self) -> &LiveBus<MetricRecord> {
        &self.bus
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Publish a sample and raise a derived log record if it crosses a threshold
    pub fn record_metric(&self, mut metric: MetricRecord) -> Arc<MetricRecord> {
        if metric.host.is_none() {
            metric.host = Some(self.default_host.to_string());
        }

        let metric = self.bus.publish(metric);

        if let Some(breach) = self.thresholds.evaluate(&metric) {
            crate::metrics::record_threshold_breach(metric.metric_type.as_str(), breach.severity.as_str());
            self.logs.publish(breach.to_log());
        }

        metric
    }

    pub fn stream(&self, filter: MetricFilter) -> Subscription<MetricRecord> {
        self.bus.subscribe(filter)
    }

    pub async fn query(&self, filter: &MetricFilter) -> Result<Vec<MetricRecord>, StoreError> {
        self.store.query(filter).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<MetricRecord, StoreError> {
        self.store.get_by_id(id).await
    }

    pub fn get_thresholds(&self) -> Vec<MetricThreshold> {
        self.thresholds.get_thresholds()
    }

    pub fn set_thresholds(&self, thresholds: Vec<MetricThreshold>) {
        self.thresholds.set_thresholds(thresholds);
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Construction parameters that do not involve I/O
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub subscriber_capacity: usize,
    pub writer: WriterConfig,
    pub default_host: String,
    pub thresholds: Vec<MetricThreshold>,
}

impl HubOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscriber_capacity: config.bus.subscriber_capacity,
            writer: WriterConfig {
                batch_size: config.storage.batch_size,
                flush_interval: config.storage.flush_interval(),
                capacity: config.storage.writer_capacity,
            },
            default_host: config.collector.resolved_host(),
            thresholds: config.thresholds.clone(),
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Process-wide owner of the event distribution core
pub struct Hub {
    pub logs: LogService,
    pub metrics: MetricsService,
    pub log_sessions: SessionRegistry<LogRecord>,
    pub metric_sessions: SessionRegistry<MetricRecord>,
    store: Option<Arc<SqliteStore>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Wire buses, writers and services over the given stores. Starts no
    /// background work besides the two writer tasks.
    pub fn with_stores(
        log_store: Arc<dyn EventStore<LogRecord>>,
        metric_store: Arc<dyn EventStore<MetricRecord>>,
        options: HubOptions,
    ) -> Self {
        let log_writer = AsyncWriter::spawn(log_store.clone(), options.writer);
        let log_bus = LiveBus::with_writer(options.subscriber_capacity, log_writer);
        let logs = LogService::new(log_bus.clone(), log_store);

        let metric_writer = AsyncWriter::spawn(metric_store.clone(), options.writer);
        let metric_bus = LiveBus::with_writer(options.subscriber_capacity, metric_writer);
        let metrics = MetricsService::new(
            metric_bus.clone(),
            metric_store,
            Arc::new(ThresholdMonitor::new(options.thresholds)),
            logs.clone(),
            options.default_host,
        );

        Self {
            logs,
            metrics,
            log_sessions: SessionRegistry::new(log_bus),
            metric_sessions: SessionRegistry::new(metric_bus),
            store: None,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Open the store from `config` and start every background task
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        ensure_database_dir(&config.storage.database_url)?;

        let store = Arc::new(SqliteStore::connect(&config.storage.database_url).await?);
        for table in ["logs", "metrics"] {
            store.set_retention(table, config.storage.retention_days).await?;
        }

        let mut hub = Self::with_stores(store.clone(), store.clone(), HubOptions::from_config(config));
        hub.store = Some(store.clone());

        let streaming = &config.streaming;
        let mut tasks = vec![
            hub.log_sessions.spawn_reconciler(streaming.reconcile_interval()),
            hub.metric_sessions.spawn_reconciler(streaming.reconcile_interval()),
            hub.log_sessions.spawn_stats_logger(streaming.stats_log_interval()),
            hub.metric_sessions.spawn_stats_logger(streaming.stats_log_interval()),
        ];

        if config.storage.cleanup_enabled {
            tasks.push(spawn_cleanup_task(
                store,
                CleanupConfig {
                    cleanup_hour: config.storage.cleanup_hour,
                    ..CleanupConfig::default()
                },
            ));
        }

        if config.collector.enabled {
            tasks.push(spawn_system_collector(hub.metrics.clone(), config.collector.interval()));
        }

        hub.tasks.lock().extend(tasks);

        hub.logs.info(
            format!("Telemetry hub started (database: {})", config.storage.database_url),
            Some("Hub"),
        );

        Ok(hub)
    }

    /// The SQLite store when started from config
    pub fn store(&self) -> Option<&Arc<SqliteStore>> {
        self.store.as_ref()
    }

    /// Stop background tasks, complete both buses (draining their writers)
    /// and release every streaming session
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }

        self.metrics.bus().shutdown().await;
        // Logs last so derived records from the final metrics are persisted
        self.logs.bus().shutdown().await;

        let released = self.metric_sessions.shutdown() + self.log_sessions.shutdown();
        tracing::info!(released_sessions = released, "Telemetry hub stopped");
    }
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_database_dir(database_url: &str) -> anyhow::Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
