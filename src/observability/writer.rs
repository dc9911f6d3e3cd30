//! Async batch writer for the persistence path
//!
//! Publishing hands every record to this writer and moves on:
//! - Bounded queue, `write()` never waits (drop-new when full)
//! - Batched inserts (`batch_size` records or every `flush_interval`)
//! - Store failures are logged and counted, never returned to the publisher
//! - `shutdown()` drains what is queued and joins the task

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::record::BusRecord;
use super::store::EventStore;

/// Writer tuning
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Queue capacity between publishers and the background task
    pub capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
            capacity: 10_000,
        }
    }
}

/// Non-blocking handle to the background writer task
pub struct AsyncWriter<R: BusRecord> {
    sender: RwLock<Option<mpsc::Sender<Arc<R>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    failed: Arc<AtomicU64>,
}

impl<R: BusRecord> AsyncWriter<R> {
    /// Spawn the writer task on the current runtime
    ///
    /// ```ignore
    /// let writer = AsyncWriter::<LogRecord>::spawn(store, WriterConfig::default());
    /// writer.write(record); // never blocks
    /// ```
    pub fn spawn(store: Arc<dyn EventStore<R>>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(writer_task(
            store,
            rx,
            config.batch_size.max(1),
            config.flush_interval,
            failed.clone(),
        ));

        Self {
            sender: RwLock::new(Some(tx)),
            task: Mutex::new(Some(task)),
            dropped: AtomicU64::new(0),
            failed,
        }
    }

    /// Queue a record for persistence
    ///
    /// Returns false when the record was not queued (queue full or writer closed).
    pub fn write(&self, record: Arc<R>) -> bool {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            tracing::debug!(kind = R::KIND, "Writer closed, record not persisted");
            return false;
        };

        match sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                crate::metrics::record_dropped(R::KIND, "writer");
                // Warn on the first drop and then every thousandth
                if dropped % 1000 == 1 {
                    tracing::warn!(
                        kind = R::KIND,
                        id = record.id().unwrap_or("-"),
                        dropped_total = dropped,
                        "Writer queue full, dropping record"
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(kind = R::KIND, "Writer task gone, record not persisted");
                false
            }
        }
    }

    /// Records rejected because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records the store failed to persist
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting records, flush the queue and wait for the task
    pub async fn shutdown(&self) {
        // Dropping the last sender lets the task drain and exit
        self.sender.write().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(kind = R::KIND, error = %e, "Writer task ended abnormally");
            }
        }
    }
}

async fn writer_task<R: BusRecord>(
    store: Arc<dyn EventStore<R>>,
    mut rx: mpsc::Receiver<Arc<R>>,
    batch_size: usize,
    flush_interval: Duration,
    failed: Arc<AtomicU64>,
) {
    let mut batch: Vec<Arc<R>> = Vec::with_capacity(batch_size);

    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(store.as_ref(), &mut batch, &failed).await;
                    }
                }
                // All senders gone and queue drained
                None => {
                    flush(store.as_ref(), &mut batch, &failed).await;
                    break;
                }
            },

            _ = flush_timer.tick() => {
                flush(store.as_ref(), &mut batch, &failed).await;
            }
        }
    }

    tracing::info!(kind = R::KIND, "Writer task shutting down");
}

async fn flush<R: BusRecord>(store: &dyn EventStore<R>, batch: &mut Vec<Arc<R>>, failed: &AtomicU64) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let start = Instant::now();

    match store.append_batch(batch).await {
        Ok(inserted) => {
            let elapsed = start.elapsed();
            tracing::debug!(
                kind = R::KIND,
                count,
                inserted,
                duration_ms = elapsed.as_millis() as u64,
                "Flushed batch"
            );
            crate::metrics::record_flush(R::KIND, elapsed);
        }
        Err(e) => {
            failed.fetch_add(count as u64, Ordering::Relaxed);
            crate::metrics::record_flush_error(R::KIND);
            tracing::error!(kind = R::KIND, error = %e, count, "Failed to flush batch");
        }
    }

    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::filter::LogFilter;
    use crate::observability::record::{LogLevel, LogRecord};
    use crate::observability::store::SqliteStore;

    async fn create_test_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
    }

    fn record(i: usize) -> Arc<LogRecord> {
        let mut r = LogRecord::new(LogLevel::Info, format!("Message {}", i)).with_context("writer");
        r.stamp();
        Arc::new(r)
    }

    async fn stored_count(store: &SqliteStore) -> usize {
        let found: Vec<LogRecord> = store.query(&LogFilter::default()).await.unwrap();
        found.len()
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let store = create_test_store().await;
        let writer = AsyncWriter::<LogRecord>::spawn(
            store.clone(),
            WriterConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(50),
                capacity: 100,
            },
        );

        for i in 0..5 {
            assert!(writer.write(record(i)));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stored_count(&store).await, 5);
    }

    #[tokio::test]
    async fn test_batch_flush() {
        let store = create_test_store().await;
        let batch_size = 3;
        let writer = AsyncWriter::<LogRecord>::spawn(
            store.clone(),
            WriterConfig {
                batch_size,
                flush_interval: Duration::from_secs(10),
                capacity: 100,
            },
        );

        for i in 0..batch_size {
            writer.write(record(i));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stored_count(&store).await, batch_size);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let store = create_test_store().await;
        let writer = AsyncWriter::<LogRecord>::spawn(
            store.clone(),
            WriterConfig {
                batch_size: 1000,
                flush_interval: Duration::from_secs(60),
                capacity: 1000,
            },
        );

        for i in 0..20 {
            writer.write(record(i));
        }
        writer.shutdown().await;

        assert_eq!(stored_count(&store).await, 20);
        assert!(!writer.write(record(99)));
    }
}
