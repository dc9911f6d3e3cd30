//! End-to-end behavior of the live bus over real log and metric records

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_bus::observability::{
    AsyncWriter, Delivery, EventStore, Hub, HubOptions, LiveBus, LogFilter, LogLevel, LogRecord, MetricFilter,
    MetricRecord, MetricType, SqliteStore, StoreError, Subscription, WriterConfig,
};

/// Store that takes a long time to fail every append
struct BrokenStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl EventStore<LogRecord> for BrokenStore {
    async fn append_batch(&self, records: &[Arc<LogRecord>]) -> Result<u64, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Err(StoreError::Corrupt {
            id: records.first().and_then(|r| r.id.clone()).unwrap_or_default(),
            reason: "disk unavailable".to_string(),
        })
    }

    async fn query(&self, _filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn get_by_id(&self, id: &str) -> Result<LogRecord, StoreError> {
        Err(StoreError::NotFound { id: id.to_string() })
    }
}

fn log(level: LogLevel, message: &str, context: &str) -> LogRecord {
    LogRecord::new(level, message).with_context(context)
}

fn drain<R: telemetry_bus::observability::BusRecord>(sub: &mut Subscription<R>) -> Vec<Arc<R>> {
    let mut events = Vec::new();
    while let Some(delivery) = sub.try_recv() {
        if let Delivery::Event(record) = delivery {
            events.push(record);
        }
    }
    events
}

#[tokio::test]
async fn test_context_subscription_receives_exactly_matching_event() {
    let bus = LiveBus::<LogRecord>::new(64);
    let mut admin = bus.subscribe(LogFilter::default().with_contexts(["admin"]));

    bus.publish(log(LogLevel::Info, "granted role", "admin"));
    bus.publish(log(LogLevel::Info, "viewed page", "user"));

    let received = drain(&mut admin);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].context.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_each_subscriber_gets_exactly_its_matching_subset() {
    let bus = LiveBus::<MetricRecord>::new(64);
    let filters = [
        MetricFilter::types([MetricType::Cpu]),
        MetricFilter::types([MetricType::Memory]),
        MetricFilter {
            min_value: Some(50.0),
            ..MetricFilter::default()
        },
        MetricFilter::default(),
    ];
    let mut subs: Vec<_> = filters.iter().cloned().map(|f| bus.subscribe(f)).collect();

    bus.publish(MetricRecord::new(MetricType::Cpu, 80.0, "%"));

    let counts: Vec<usize> = subs.iter_mut().map(|s| drain(s).len()).collect();
    assert_eq!(counts, vec![1, 0, 1, 1]);
}

#[tokio::test]
async fn test_late_subscriber_sees_only_later_events_in_order() {
    let bus = LiveBus::<LogRecord>::new(64);
    bus.publish(log(LogLevel::Info, "e1", "app"));
    bus.publish(log(LogLevel::Info, "e2", "app"));

    let mut late = bus.subscribe(LogFilter::default());
    for name in ["e3", "e4", "e5"] {
        bus.publish(log(LogLevel::Info, name, "app"));
    }

    let messages: Vec<String> = drain(&mut late).iter().map(|r| r.message.render()).collect();
    assert_eq!(messages, vec!["e3", "e4", "e5"]);
}

#[tokio::test]
async fn test_unsubscribe_after_shutdown_is_harmless() {
    let bus = LiveBus::<LogRecord>::new(8);
    let mut sub = bus.subscribe(LogFilter::default());
    let id = sub.id();

    bus.shutdown().await;
    assert!(!bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));

    bus.publish(log(LogLevel::Error, "after shutdown", "app"));
    assert!(drain(&mut sub).is_empty());
}

#[tokio::test]
async fn test_failing_store_does_not_delay_live_delivery() {
    let store = Arc::new(BrokenStore {
        attempts: AtomicUsize::new(0),
    });
    let writer = AsyncWriter::<LogRecord>::spawn(
        store.clone(),
        WriterConfig {
            batch_size: 1,
            flush_interval: Duration::from_millis(10),
            capacity: 16,
        },
    );
    let bus = LiveBus::with_writer(16, writer);
    let mut sub = bus.subscribe(LogFilter::default());

    // Keep the store busy failing
    bus.publish(log(LogLevel::Info, "first", "app"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = drain(&mut sub);

    bus.publish(log(LogLevel::Error, "second", "app"));
    let delivered = tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .expect("live delivery was delayed by the store");
    match delivered {
        Some(Delivery::Event(record)) => assert_eq!(record.message.render(), "second"),
        other => panic!("unexpected delivery: {:?}", other),
    }

    bus.shutdown().await;
    assert!(store.attempts.load(Ordering::SeqCst) >= 1);
    assert!(bus.writer().unwrap().failed_count() >= 1);
}

#[tokio::test]
async fn test_threshold_breaches_reach_log_subscribers_and_store() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let hub = Hub::with_stores(store.clone(), store, HubOptions::default());
    let mut alerts = hub.logs.stream(LogFilter::min_level(LogLevel::Warn));

    hub.metrics.record_metric(MetricRecord::new(MetricType::Cpu, 95.0, "%"));
    hub.metrics.record_metric(MetricRecord::new(MetricType::Cpu, 75.0, "%"));
    hub.metrics.record_metric(MetricRecord::new(MetricType::Cpu, 5.0, "%"));

    let levels: Vec<LogLevel> = drain(&mut alerts).iter().map(|r| r.level).collect();
    assert_eq!(levels, vec![LogLevel::Error, LogLevel::Warn]);

    hub.shutdown().await;

    let stored = hub.logs.query(&LogFilter::min_level(LogLevel::Warn)).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[1].message.render().contains("CRITICAL"));
    assert!(stored[1].message.render().contains("95"));
}
