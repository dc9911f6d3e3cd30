//! Binding of bus subscriptions to transport connections
//!
//! Each streaming connection (SSE response, WebSocket) gets a
//! [`ConnectionId`] and holds at most one subscription at a time. The
//! transport keeps the returned [`SessionGuard`] for as long as the connection
//! lives; dropping it (client gone, stream dropped) releases the session.
//!
//! The guard is the presence token: its drop removes the entry at once. The
//! reconciliation sweep covers sessions whose guard never ran its drop (leaked
//! or forgotten): once the subscription itself has left the bus, the entry is
//! force-removed on the next sweep.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::bus::{LiveBus, SubscriberId, Subscription};
use super::record::BusRecord;

/// Identity of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SessionEntry {
    subscriber_id: SubscriberId,
    opened_at: Instant,
}

struct RegistryInner<R: BusRecord> {
    bus: LiveBus<R>,
    sessions: DashMap<ConnectionId, SessionEntry>,
}

impl<R: BusRecord> RegistryInner<R> {
    /// Remove the session only if it still holds `subscriber_id`
    fn release_if_current(&self, conn_id: ConnectionId, subscriber_id: SubscriberId) {
        let removed = self
            .sessions
            .remove_if(&conn_id, |_, entry| entry.subscriber_id == subscriber_id);
        if removed.is_some() {
            self.bus.unsubscribe(subscriber_id);
            crate::metrics::set_sessions(R::KIND, self.sessions.len());
            tracing::debug!(kind = R::KIND, connection = %conn_id, "Session released on disconnect");
        }
    }
}

/// Connection-to-subscription registry for one bus
pub struct SessionRegistry<R: BusRecord> {
    inner: Arc<RegistryInner<R>>,
}

impl<R: BusRecord> Clone for SessionRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Presence token held by the transport for the lifetime of a session
pub struct SessionGuard<R: BusRecord> {
    conn_id: ConnectionId,
    subscriber_id: SubscriberId,
    registry: Weak<RegistryInner<R>>,
}

impl<R: BusRecord> SessionGuard<R> {
    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }
}

impl<R: BusRecord> Drop for SessionGuard<R> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release_if_current(self.conn_id, self.subscriber_id);
        }
    }
}

impl<R: BusRecord> SessionRegistry<R> {
    pub fn new(bus: LiveBus<R>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bus,
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &LiveBus<R> {
        &self.inner.bus
    }

    /// Open a subscription for `conn_id`, replacing any it already had
    pub fn attach(&self, conn_id: ConnectionId, filter: R::Filter) -> (Subscription<R>, SessionGuard<R>) {
        let subscription = self.inner.bus.subscribe(filter);

        let entry = SessionEntry {
            subscriber_id: subscription.id(),
            opened_at: Instant::now(),
        };

        if let Some(previous) = self.inner.sessions.insert(conn_id, entry) {
            self.inner.bus.unsubscribe(previous.subscriber_id);
            tracing::debug!(
                kind = R::KIND,
                connection = %conn_id,
                replaced = previous.subscriber_id,
                "Replaced existing subscription"
            );
        }
        crate::metrics::set_sessions(R::KIND, self.inner.sessions.len());

        let guard = SessionGuard {
            conn_id,
            subscriber_id: subscription.id(),
            registry: Arc::downgrade(&self.inner),
        };

        (subscription, guard)
    }

    /// Unsubscribe whatever `conn_id` holds. Idempotent.
    pub fn release(&self, conn_id: ConnectionId) -> bool {
        match self.inner.sessions.remove(&conn_id) {
            Some((_, entry)) => {
                self.inner.bus.unsubscribe(entry.subscriber_id);
                crate::metrics::set_sessions(R::KIND, self.inner.sessions.len());
                tracing::debug!(
                    kind = R::KIND,
                    connection = %conn_id,
                    open_secs = entry.opened_at.elapsed().as_secs(),
                    "Session released"
                );
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, conn_id: ConnectionId) -> bool {
        self.inner.sessions.contains_key(&conn_id)
    }

    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Drop entries whose subscription is no longer on the bus
    ///
    /// Returns how many were removed.
    pub fn reconcile(&self) -> usize {
        let bus = &self.inner.bus;
        let mut stale = Vec::new();

        self.inner.sessions.retain(|conn_id, entry| {
            let alive = bus.contains(entry.subscriber_id);
            if !alive {
                stale.push((*conn_id, entry.subscriber_id));
            }
            alive
        });

        for (conn_id, subscriber_id) in &stale {
            bus.unsubscribe(*subscriber_id);
            tracing::warn!(kind = R::KIND, connection = %conn_id, "Removed stale subscription");
        }

        crate::metrics::set_sessions(R::KIND, self.inner.sessions.len());
        stale.len()
    }

    /// Release every session
    pub fn shutdown(&self) -> usize {
        let conn_ids: Vec<ConnectionId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        let released = conn_ids.into_iter().filter(|id| self.release(*id)).count();
        tracing::info!(kind = R::KIND, released, "Released all streaming sessions");
        released
    }

    /// Periodic reconciliation sweep
    pub fn spawn_reconciler(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick fires immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let removed = registry.reconcile();
                tracing::debug!(
                    kind = R::KIND,
                    removed,
                    active_sessions = registry.count(),
                    "Session reconciliation completed"
                );
            }
        })
    }

    /// Periodic log line with the number of open sessions
    pub fn spawn_stats_logger(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                interval.tick().await;
                tracing::info!(
                    kind = R::KIND,
                    active_sessions = registry.count(),
                    subscribers = registry.bus().subscriber_count(),
                    "Streaming session stats"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::bus::Delivery;
    use crate::observability::filter::MetricFilter;
    use crate::observability::record::{MetricRecord, MetricType};

    fn registry() -> SessionRegistry<MetricRecord> {
        SessionRegistry::new(LiveBus::new(16))
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_subscription() {
        let registry = registry();
        let conn = ConnectionId::new();

        let (mut first, first_guard) = registry.attach(conn, MetricFilter::default());
        let (mut second, _second_guard) = registry.attach(conn, MetricFilter::default());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.bus().subscriber_count(), 1);

        // The replaced guard going away must not release the new session
        drop(first_guard);
        assert!(registry.is_attached(conn));

        registry.bus().publish(MetricRecord::new(MetricType::Cpu, 10.0, "%"));
        assert!(first.recv().await.is_none());
        assert!(matches!(second.try_recv(), Some(Delivery::Event(_))));
    }

    #[tokio::test]
    async fn test_dropping_guard_releases_session() {
        let registry = registry();
        let conn = ConnectionId::new();
        let (_sub, guard) = registry.attach(conn, MetricFilter::default());

        drop(guard);
        assert!(!registry.is_attached(conn));
        assert_eq!(registry.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let registry = registry();
        let conn = ConnectionId::new();
        let (_sub, _guard) = registry.attach(conn, MetricFilter::default());

        assert!(registry.release(conn));
        assert!(!registry.release(conn));
        assert!(!registry.release(ConnectionId::new()));
    }

    #[tokio::test]
    async fn test_reconcile_removes_leaked_sessions() {
        let registry = registry();
        let live = ConnectionId::new();
        let leaked = ConnectionId::new();

        let (_live_sub, _live_guard) = registry.attach(live, MetricFilter::default());
        let (leaked_sub, leaked_guard) = registry.attach(leaked, MetricFilter::default());

        // A guard that never runs its drop leaves the entry behind; it stays
        // while the subscription is still being consumed
        std::mem::forget(leaked_guard);
        assert_eq!(registry.reconcile(), 0);
        assert!(registry.is_attached(leaked));

        // Once the subscription is gone from the bus, the sweep catches it
        drop(leaked_sub);
        assert_eq!(registry.reconcile(), 1);
        assert!(!registry.is_attached(leaked));
        assert!(registry.is_attached(live));
    }

    #[tokio::test]
    async fn test_reconcile_after_bus_completion() {
        let registry = registry();
        let conn = ConnectionId::new();
        let (_sub, guard) = registry.attach(conn, MetricFilter::default());
        std::mem::forget(guard);

        registry.bus().shutdown().await;
        assert_eq!(registry.reconcile(), 1);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let registry = registry();
        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(registry.attach(ConnectionId::new(), MetricFilter::default()));
        }

        assert_eq!(registry.shutdown(), 3);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.bus().subscriber_count(), 0);
    }
}
