//! Server-Sent Events adapter for bus subscriptions
//!
//! Frame sequence: `{"type":"connected"}`, then one frame per record, with
//! `{"type":"lagged","dropped":n}` when the subscriber fell behind and a final
//! `{"type":"complete"}` or `{"type":"error","message":..}` when the bus ends.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::{Duration, Instant};

use crate::observability::session::{ConnectionId, SessionGuard, SessionRegistry};
use crate::observability::{BusRecord, CloseReason, Delivery};

/// Render one delivery as an SSE data frame
pub fn delivery_frame<R: BusRecord + Serialize>(delivery: &Delivery<R>) -> String {
    let value = match delivery {
        Delivery::Event(record) => serde_json::to_value(record.as_ref()).unwrap_or_else(|e| {
            tracing::warn!(kind = R::KIND, error = %e, "Failed to serialize record for stream");
            json!({ "type": "error", "message": "serialization failed" })
        }),
        Delivery::Lagged(dropped) => json!({ "type": "lagged", "dropped": dropped }),
        Delivery::Closed(CloseReason::Completed) => json!({ "type": "complete" }),
        Delivery::Closed(CloseReason::Failed(message)) => json!({ "type": "error", "message": message }),
    };
    value.to_string()
}

pub fn connected_frame() -> String {
    json!({ "type": "connected" }).to_string()
}

/// Attach a new session and stream it as SSE
///
/// The session guard lives inside the response stream, so the session is
/// released as soon as the client disconnects and axum drops the body.
pub fn stream_session<R: BusRecord + Serialize>(
    registry: &SessionRegistry<R>,
    filter: R::Filter,
    keepalive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let conn_id = ConnectionId::new();
    let (subscription, guard) = registry.attach(conn_id, filter);
    tracing::info!(kind = R::KIND, connection = %conn_id, "SSE client connected");

    let connected = stream::once(async { Ok::<_, Infallible>(Event::default().data(connected_frame())) });
    let deliveries = subscription
        .into_stream()
        .map(with_session(SseSession::new(guard), |delivery: Delivery<R>| {
            Ok::<_, Infallible>(Event::default().data(delivery_frame(&delivery)))
        }));

    Sse::new(connected.chain(deliveries)).keep_alive(KeepAlive::new().interval(keepalive))
}

/// Session held by an SSE response body; logs the disconnect when axum drops it
struct SseSession<R: BusRecord> {
    guard: SessionGuard<R>,
    opened_at: Instant,
}

impl<R: BusRecord> SseSession<R> {
    fn new(guard: SessionGuard<R>) -> Self {
        Self {
            guard,
            opened_at: Instant::now(),
        }
    }
}

impl<R: BusRecord> Drop for SseSession<R> {
    fn drop(&mut self) {
        tracing::info!(
            kind = R::KIND,
            connection = %self.guard.connection_id(),
            open_secs = self.opened_at.elapsed().as_secs(),
            "SSE client disconnected"
        );
    }
}

/// Keep `session` alive for as long as the mapping closure is
fn with_session<R: BusRecord, T, U>(session: SseSession<R>, mut f: impl FnMut(T) -> U) -> impl FnMut(T) -> U {
    move |item| {
        let _session = &session;
        f(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{LiveBus, MetricRecord, MetricType};
    use std::sync::Arc;

    #[test]
    fn test_frames() {
        let record = MetricRecord::new(MetricType::Cpu, 12.5, "%");
        let frame = delivery_frame(&Delivery::Event(Arc::new(record)));
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "cpu");
        assert_eq!(parsed["value"], 12.5);

        let frame = |d: Delivery<MetricRecord>| -> serde_json::Value {
            serde_json::from_str(&delivery_frame(&d)).unwrap()
        };
        assert_eq!(frame(Delivery::Lagged(3)), json!({"type": "lagged", "dropped": 3}));
        assert_eq!(frame(Delivery::Closed(CloseReason::Completed)), json!({"type": "complete"}));
        assert_eq!(
            frame(Delivery::Closed(CloseReason::Failed("db down".into()))),
            json!({"type": "error", "message": "db down"})
        );
    }

    #[tokio::test]
    async fn test_dropping_response_releases_session() {
        let registry = SessionRegistry::new(LiveBus::<MetricRecord>::new(8));
        let response = stream_session(&registry, Default::default(), Duration::from_secs(15));
        assert_eq!(registry.count(), 1);

        drop(response);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.bus().subscriber_count(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLines(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLines {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_logged() {
        use tracing_subscriber::prelude::*;

        let captured = CapturedLines::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );

        let registry = SessionRegistry::new(LiveBus::<MetricRecord>::new(8));
        tracing::subscriber::with_default(subscriber, || {
            let response = stream_session(&registry, Default::default(), Duration::from_secs(15));
            drop(response);
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("SSE client connected"));
        assert!(output.contains("SSE client disconnected"));
    }
}
