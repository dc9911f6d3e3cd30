//! Live bus: in-process fan-out of published records
//!
//! Every subscriber owns a bounded queue. `publish` evaluates each
//! subscriber's filter and pushes into its queue without ever waiting on the
//! consumer; a full queue drops its oldest entry and the consumer is told how
//! many it missed (`Delivery::Lagged`). Persistence runs beside delivery
//! through the [`AsyncWriter`], so a slow or failing store never touches the
//! live path.
//!
//! Only records published after `subscribe` returns are delivered.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use super::filter::RecordFilter;
use super::record::BusRecord;
use super::writer::AsyncWriter;

pub type SubscriberId = u64;

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Why a subscription ended on the bus side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The bus shut down normally
    Completed,
    /// The bus was terminated with an error
    Failed(String),
}

/// One item handed to a subscriber
#[derive(Debug, Clone)]
pub enum Delivery<R> {
    Event(Arc<R>),
    /// This many older records were dropped from a full queue
    Lagged(u64),
    /// Terminal; `recv` returns `None` afterwards
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

struct SlotState<R> {
    queue: VecDeque<Arc<R>>,
    lagged: u64,
    closed: Option<CloseReason>,
    close_delivered: bool,
    /// Unsubscribed: nothing more is delivered, not even a close notice
    detached: bool,
}

/// Subscriber side of the registry
struct Slot<R: BusRecord> {
    id: SubscriberId,
    filter: R::Filter,
    capacity: usize,
    state: Mutex<SlotState<R>>,
    notify: Notify,
}

enum PushOutcome {
    Queued,
    QueuedDroppingOldest,
    Rejected,
}

impl<R: BusRecord> Slot<R> {
    fn new(id: SubscriberId, filter: R::Filter, capacity: usize) -> Self {
        Self {
            id,
            filter,
            capacity: capacity.max(1),
            state: Mutex::new(SlotState {
                queue: VecDeque::new(),
                lagged: 0,
                closed: None,
                close_delivered: false,
                detached: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, record: &Arc<R>) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.detached || state.closed.is_some() {
                return PushOutcome::Rejected;
            }
            let outcome = if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.lagged += 1;
                PushOutcome::QueuedDroppingOldest
            } else {
                PushOutcome::Queued
            };
            state.queue.push_back(Arc::clone(record));
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }

    fn detach(&self) {
        {
            let mut state = self.state.lock();
            state.detached = true;
            state.queue.clear();
            state.lagged = 0;
        }
        self.notify.notify_one();
    }

    /// Next item without waiting. `Err(())` means nothing is ready yet.
    fn poll_next(&self) -> Result<Option<Delivery<R>>, ()> {
        let mut state = self.state.lock();
        if state.detached {
            return Ok(None);
        }
        // Older records were dropped, so the gap is reported before what remains
        if state.lagged > 0 {
            let missed = std::mem::take(&mut state.lagged);
            return Ok(Some(Delivery::Lagged(missed)));
        }
        if let Some(record) = state.queue.pop_front() {
            return Ok(Some(Delivery::Event(record)));
        }
        match state.closed.clone() {
            Some(reason) if !state.close_delivered => {
                state.close_delivered = true;
                Ok(Some(Delivery::Closed(reason)))
            }
            Some(_) => Ok(None),
            None => Err(()),
        }
    }
}

struct BusInner<R: BusRecord> {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Slot<R>>>>,
    next_id: AtomicU64,
    capacity: usize,
    writer: Option<AsyncWriter<R>>,
    terminal: Mutex<Option<CloseReason>>,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<R: BusRecord> BusInner<R> {
    fn remove(&self, id: SubscriberId) -> Option<Arc<Slot<R>>> {
        let mut subscribers = self.subscribers.write();
        let removed = subscribers.remove(&id);
        crate::metrics::set_subscribers(R::KIND, subscribers.len());
        removed
    }
}

/// Cheaply cloneable handle to one live bus
pub struct LiveBus<R: BusRecord> {
    inner: Arc<BusInner<R>>,
}

impl<R: BusRecord> Clone for LiveBus<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BusRecord> LiveBus<R> {
    /// A bus without persistence
    pub fn new(subscriber_capacity: usize) -> Self {
        Self::build(subscriber_capacity, None)
    }

    /// A bus that forwards every published record to `writer`
    pub fn with_writer(subscriber_capacity: usize, writer: AsyncWriter<R>) -> Self {
        Self::build(subscriber_capacity, Some(writer))
    }

    fn build(capacity: usize, writer: Option<AsyncWriter<R>>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity,
                writer,
                terminal: Mutex::new(None),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Stamp, fan out to matching subscribers, then queue for persistence
    ///
    /// Never waits on consumers or on the store.
    pub fn publish(&self, mut record: R) -> Arc<R> {
        record.stamp();
        let record = Arc::new(record);

        if self.inner.closed.load(Ordering::Acquire) {
            tracing::debug!(kind = R::KIND, id = record.id().unwrap_or("-"), "Publish after bus shutdown ignored");
            return record;
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_published(R::KIND);

        let mut delivered = 0u64;
        {
            let subscribers = self.inner.subscribers.read();
            for slot in subscribers.values() {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    if slot.filter.matches(&record) {
                        Some(slot.push(&record))
                    } else {
                        None
                    }
                }));

                match outcome {
                    Ok(Some(PushOutcome::Queued)) => delivered += 1,
                    Ok(Some(PushOutcome::QueuedDroppingOldest)) => {
                        delivered += 1;
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_dropped(R::KIND, "subscriber");
                    }
                    Ok(Some(PushOutcome::Rejected)) | Ok(None) => {}
                    Err(_) => {
                        tracing::error!(
                            kind = R::KIND,
                            subscriber = slot.id,
                            "Delivery to subscriber panicked, skipping"
                        );
                    }
                }
            }
        }

        self.inner.delivered.fetch_add(delivered, Ordering::Relaxed);
        crate::metrics::record_delivered(R::KIND, delivered);

        if let Some(writer) = &self.inner.writer {
            writer.write(Arc::clone(&record));
        }

        record
    }

    /// Register a consumer; it sees only records published from now on
    ///
    /// On a terminated bus the subscription reports the terminal reason at once.
    pub fn subscribe(&self, filter: R::Filter) -> Subscription<R> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, filter, self.inner.capacity));

        {
            let mut subscribers = self.inner.subscribers.write();
            // Checked under the registry lock so a concurrent shutdown cannot miss this slot
            let terminal = self.inner.terminal.lock().clone();
            match terminal {
                Some(reason) => slot.close(reason),
                None => {
                    subscribers.insert(id, Arc::clone(&slot));
                    crate::metrics::set_subscribers(R::KIND, subscribers.len());
                }
            }
        }

        tracing::debug!(kind = R::KIND, subscriber = id, "Subscriber registered");

        Subscription {
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Idempotent; returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.inner.remove(id) {
            Some(slot) => {
                slot.detach();
                tracing::debug!(kind = R::KIND, subscriber = id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still registered
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.read().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn writer(&self) -> Option<&AsyncWriter<R>> {
        self.inner.writer.as_ref()
    }

    /// Close every subscriber with `reason`. Only the first call has effect.
    fn terminate(&self, reason: CloseReason) -> bool {
        let slots: Vec<Arc<Slot<R>>> = {
            let mut subscribers = self.inner.subscribers.write();
            let mut terminal = self.inner.terminal.lock();
            if terminal.is_some() {
                return false;
            }
            *terminal = Some(reason.clone());
            self.inner.closed.store(true, Ordering::Release);
            crate::metrics::set_subscribers(R::KIND, 0);
            subscribers.drain().map(|(_, slot)| slot).collect()
        };

        for slot in &slots {
            slot.close(reason.clone());
        }

        tracing::info!(kind = R::KIND, subscribers = slots.len(), reason = ?reason, "Bus terminated");
        true
    }

    /// Terminate every subscriber with an error
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.terminate(CloseReason::Failed(message.into()))
    }

    /// Complete every subscriber and drain the persistence queue
    pub async fn shutdown(&self) {
        self.terminate(CloseReason::Completed);
        if let Some(writer) = &self.inner.writer {
            writer.shutdown().await;
        }
    }
}

/// A consumer's registration on a [`LiveBus`]
///
/// Dropping it unsubscribes.
pub struct Subscription<R: BusRecord> {
    slot: Arc<Slot<R>>,
    bus: Weak<BusInner<R>>,
}

impl<R: BusRecord> Subscription<R> {
    pub fn id(&self) -> SubscriberId {
        self.slot.id
    }

    pub fn filter(&self) -> &R::Filter {
        &self.slot.filter
    }

    /// Next delivery, waiting if none is queued
    ///
    /// Returns `None` once the subscription has ended (after `Closed`, or after
    /// an unsubscribe).
    pub async fn recv(&mut self) -> Option<Delivery<R>> {
        loop {
            match self.slot.poll_next() {
                Ok(next) => return next,
                Err(()) => self.slot.notify.notified().await,
            }
        }
    }

    /// Next delivery if one is ready
    pub fn try_recv(&mut self) -> Option<Delivery<R>> {
        self.slot.poll_next().ok().flatten()
    }

    /// Adapt into a `Stream` of deliveries
    pub fn into_stream(self) -> impl futures::Stream<Item = Delivery<R>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|delivery| (delivery, sub))
        })
    }
}

impl<R: BusRecord> Drop for Subscription<R> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.slot.id).is_some() {
                tracing::debug!(kind = R::KIND, subscriber = self.slot.id, "Subscription dropped");
            }
        }
        self.slot.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::filter::{LogFilter, MetricFilter};
    use crate::observability::record::{LogLevel, LogRecord, MetricRecord, MetricType};
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    /// Minimal record whose filter can be told to panic
    #[derive(Debug, Clone)]
    struct Tick {
        id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        n: u32,
    }

    #[derive(Debug, Clone, Default)]
    struct TickFilter {
        panic_on: Option<u32>,
    }

    impl RecordFilter<Tick> for TickFilter {
        fn matches(&self, record: &Tick) -> bool {
            if self.panic_on == Some(record.n) {
                panic!("tick filter exploded");
            }
            true
        }
    }

    impl BusRecord for Tick {
        type Filter = TickFilter;
        const KIND: &'static str = "tick";

        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }

        fn timestamp(&self) -> Option<DateTime<Utc>> {
            self.timestamp
        }

        fn stamp(&mut self) {
            self.id.get_or_insert_with(|| format!("tick-{}", self.n));
            self.timestamp.get_or_insert_with(Utc::now);
        }
    }

    fn tick(n: u32) -> Tick {
        Tick {
            id: None,
            timestamp: None,
            n,
        }
    }

    fn event<R>(delivery: Option<Delivery<R>>) -> Arc<R> {
        match delivery {
            Some(Delivery::Event(record)) => record,
            _ => panic!("expected an event delivery"),
        }
    }

    fn log(level: LogLevel, context: &str) -> LogRecord {
        LogRecord::new(level, format!("{} event", context)).with_context(context)
    }

    #[tokio::test]
    async fn test_publish_stamps_record() {
        let bus = LiveBus::<LogRecord>::new(16);
        let published = bus.publish(LogRecord::new(LogLevel::Info, "hello"));
        assert!(published.id.is_some());
        assert!(published.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_delivers_only_to_matching_subscribers() {
        let bus = LiveBus::<LogRecord>::new(16);
        let mut admin = bus.subscribe(LogFilter::default().with_contexts(["admin"]));
        let mut errors = bus.subscribe(LogFilter::min_level(LogLevel::Error));
        let mut all = bus.subscribe(LogFilter::default());

        bus.publish(log(LogLevel::Info, "admin"));
        bus.publish(log(LogLevel::Info, "user"));

        assert_eq!(event(admin.try_recv()).context.as_deref(), Some("admin"));
        assert!(admin.try_recv().is_none());
        assert!(errors.try_recv().is_none());
        assert_eq!(event(all.try_recv()).context.as_deref(), Some("admin"));
        assert_eq!(event(all.try_recv()).context.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_backfill() {
        let bus = LiveBus::<MetricRecord>::new(16);
        bus.publish(MetricRecord::new(MetricType::Cpu, 1.0, "%"));
        bus.publish(MetricRecord::new(MetricType::Cpu, 2.0, "%"));

        let mut late = bus.subscribe(MetricFilter::default());
        for v in [3.0, 4.0, 5.0] {
            bus.publish(MetricRecord::new(MetricType::Cpu, v, "%"));
        }

        let values: Vec<f64> = (0..3).map(|_| event(late.try_recv()).value).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0]);
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = LiveBus::<Tick>::new(16);
        let mut sub = bus.subscribe(TickFilter::default());
        let id = sub.id();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(tick(1));
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);

        bus.shutdown().await;
        assert!(!bus.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports_lag() {
        let bus = LiveBus::<Tick>::new(2);
        let mut sub = bus.subscribe(TickFilter::default());

        for n in 0..5 {
            bus.publish(tick(n));
        }

        assert!(matches!(sub.try_recv(), Some(Delivery::Lagged(3))));
        assert_eq!(event(sub.try_recv()).n, 3);
        assert_eq!(event(sub.try_recv()).n, 4);
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.stats().dropped, 3);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_others() {
        let bus = LiveBus::<Tick>::new(4);
        let _stalled = bus.subscribe(TickFilter::default());
        let mut active = bus.subscribe(TickFilter::default());

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.last() != Some(&99) {
                match active.recv().await {
                    Some(Delivery::Event(p)) => seen.push(p.n),
                    Some(_) => {}
                    None => break,
                }
            }
            seen
        });

        for n in 0..100 {
            bus.publish(tick(n));
            tokio::task::yield_now().await;
        }

        let seen = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.last(), Some(&99));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(bus.stats().dropped >= 96);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = LiveBus::<Tick>::new(16);
        let mut fragile = bus.subscribe(TickFilter { panic_on: Some(7) });
        let mut healthy = bus.subscribe(TickFilter::default());

        bus.publish(tick(7));
        bus.publish(tick(8));

        assert_eq!(event(healthy.try_recv()).n, 7);
        assert_eq!(event(healthy.try_recv()).n, 8);
        assert_eq!(event(fragile.try_recv()).n, 8);
    }

    #[tokio::test]
    async fn test_shutdown_completes_subscribers() {
        let bus = LiveBus::<Tick>::new(16);
        let mut sub = bus.subscribe(TickFilter::default());
        bus.publish(tick(1));

        bus.shutdown().await;

        assert_eq!(event(sub.recv().await).n, 1);
        assert!(matches!(sub.recv().await, Some(Delivery::Closed(CloseReason::Completed))));
        assert!(sub.recv().await.is_none());

        // Nothing published after shutdown reaches anyone
        let mut after = bus.subscribe(TickFilter::default());
        bus.publish(tick(2));
        assert!(matches!(after.recv().await, Some(Delivery::Closed(CloseReason::Completed))));
        assert!(after.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_reports_error() {
        let bus = LiveBus::<Tick>::new(16);
        let mut sub = bus.subscribe(TickFilter::default());

        assert!(bus.fail("store unreachable"));
        assert!(!bus.fail("again"));

        match sub.recv().await {
            Some(Delivery::Closed(CloseReason::Failed(msg))) => assert_eq!(msg, "store unreachable"),
            other => panic!("unexpected delivery: {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = LiveBus::<Tick>::new(16);
        {
            let _sub = bus.subscribe(TickFilter::default());
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = LiveBus::<Tick>::new(16);
        let mut sub = bus.subscribe(TickFilter::default());

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(tick(42));
        });

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(event(received).n, 42);
    }
}
