//! Log and metric event distribution
//!
//! Every record goes down two paths from a single `publish` call:
//!
//! ```text
//! producer ──► LiveBus::publish ──┬──► matching subscriptions (SSE / WebSocket)
//!                                 └──► AsyncWriter ──► SqliteStore (batched)
//! ```
//!
//! The live path never waits on the durable one. History is read back with
//! the same filter types used for live subscriptions, so a record either
//! matches a filter on both paths or on neither.

pub mod bus;
pub mod cleanup;
pub mod collector;
pub mod filter;
pub mod record;
pub mod service;
pub mod session;
pub mod store;
pub mod threshold;
pub mod writer;

pub use bus::{CloseReason, Delivery, LiveBus, Subscription};
pub use cleanup::{run_cleanup_now, spawn_cleanup_task, CleanupConfig};
pub use filter::{LogFilter, MetricFilter, RecordFilter};
pub use record::{AuditInfo, AuditStatus, BusRecord, LogLevel, LogRecord, MetricRecord, MetricType, Payload};
pub use service::{Hub, HubOptions, LogService, MetricsService};
pub use session::{ConnectionId, SessionGuard, SessionRegistry};
pub use store::{EventStore, SqliteStore, StoreError};
pub use threshold::{MetricThreshold, ThresholdMonitor};
pub use writer::{AsyncWriter, WriterConfig};
