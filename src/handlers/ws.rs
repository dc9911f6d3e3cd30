//! WebSocket gateway for metrics
//!
//! Client frames (`{"event": .., "data": ..}`):
//! - `subscribe` with a filter: replaces the connection's live subscription
//! - `unsubscribe`
//! - `getHistorical` with a filter: one bounded store query
//!
//! Server frames: `metric`, `subscribed`, `unsubscribed`, `historical`,
//! `lagged`, `complete`, `error`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::observability::filter::MetricFilterMessage;
use crate::observability::session::{ConnectionId, SessionGuard};
use crate::observability::{CloseReason, Delivery, MetricRecord, MetricType, Subscription};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe(Option<MetricFilterMessage>),
    Unsubscribe,
    GetHistorical(Option<MetricFilterMessage>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Metric(MetricRecord),
    Subscribed { filter: MetricFilterMessage },
    Unsubscribed,
    Historical(Vec<MetricRecord>),
    Lagged { dropped: u64 },
    Complete,
    Error { message: String },
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize WebSocket frame");
                None
            }
        }
    }
}

type ActiveSession = (Subscription<MetricRecord>, SessionGuard<MetricRecord>);

/// GET /api/v1/metrics/ws
pub async fn metrics_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = ConnectionId::new();
    let (mut sender, mut receiver) = socket.split();
    let mut active: Option<ActiveSession> = None;

    tracing::info!(connection = %conn_id, "WebSocket client connected");

    loop {
        let outgoing: Vec<ServerMessage> = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, conn_id, &mut active, &text).await
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(connection = %conn_id, error = %e, "WebSocket receive failed");
                    break;
                }
            },
            delivery = next_delivery(&mut active) => match delivery {
                Some(delivery) => {
                    let (message, ended) = delivery_message(delivery);
                    if ended {
                        active = None;
                    }
                    vec![message]
                }
                // Replaced, reconciled or released elsewhere
                None => {
                    active = None;
                    continue;
                }
            },
        };

        for message in outgoing {
            let Some(frame) = message.to_frame() else { continue };
            if let Err(e) = sender.send(frame).await {
                tracing::debug!(connection = %conn_id, error = %e, "WebSocket send failed, closing");
                release(&state, conn_id, active.take());
                return;
            }
        }
    }

    release(&state, conn_id, active.take());
}

fn release(state: &AppState, conn_id: ConnectionId, active: Option<ActiveSession>) {
    drop(active);
    state.hub.metric_sessions.release(conn_id);
    tracing::info!(connection = %conn_id, "WebSocket client disconnected");
}

/// Next delivery of the active subscription; pends forever without one
async fn next_delivery(active: &mut Option<ActiveSession>) -> Option<Delivery<MetricRecord>> {
    match active {
        Some((subscription, _)) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Server frame for a delivery, and whether the subscription ended with it
fn delivery_message(delivery: Delivery<MetricRecord>) -> (ServerMessage, bool) {
    match delivery {
        Delivery::Event(record) => (ServerMessage::Metric(record.as_ref().clone()), false),
        Delivery::Lagged(dropped) => (ServerMessage::Lagged { dropped }, false),
        Delivery::Closed(CloseReason::Completed) => (ServerMessage::Complete, true),
        Delivery::Closed(CloseReason::Failed(message)) => (ServerMessage::Error { message }, true),
    }
}

/// Apply one client frame to the connection and return the replies
pub async fn handle_client_text(
    state: &AppState,
    conn_id: ConnectionId,
    active: &mut Option<ActiveSession>,
    text: &str,
) -> Vec<ServerMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(connection = %conn_id, error = %e, "Invalid WebSocket message");
            return vec![ServerMessage::error(format!("Invalid message: {}", e))];
        }
    };

    match message {
        ClientMessage::Subscribe(filter) => {
            let filter = filter.unwrap_or_default();
            let session = state.hub.metric_sessions.attach(conn_id, filter.clone().into_filter());
            // The replaced guard sees a newer session and leaves it alone
            *active = Some(session);
            tracing::debug!(connection = %conn_id, filter = ?filter, "WebSocket subscribed");
            vec![ServerMessage::Subscribed { filter }]
        }
        ClientMessage::Unsubscribe => {
            *active = None;
            state.hub.metric_sessions.release(conn_id);
            vec![ServerMessage::Unsubscribed]
        }
        ClientMessage::GetHistorical(filter) => vec![historical(state, filter).await],
    }
}

async fn historical(state: &AppState, filter: Option<MetricFilterMessage>) -> ServerMessage {
    let mut filter = filter.unwrap_or_default();
    if filter.types.is_empty() {
        filter.types = [MetricType::Cpu, MetricType::Memory]
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
    }

    let timeout = state.streaming.historical_timeout();
    let filter = filter.into_filter();

    match tokio::time::timeout(timeout, state.hub.metrics.query(&filter)).await {
        Ok(Ok(records)) => ServerMessage::Historical(records),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Historical metrics query failed");
            ServerMessage::error(format!("Historical query failed: {}", e))
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Historical metrics query timed out");
            ServerMessage::error("Historical query timed out")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::observability::{EventStore, Hub, HubOptions, MetricFilter, SqliteStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    /// Metric store whose queries outlive any reasonable deadline
    struct StalledStore;

    #[async_trait]
    impl EventStore<MetricRecord> for StalledStore {
        async fn append_batch(&self, records: &[Arc<MetricRecord>]) -> Result<u64, StoreError> {
            Ok(records.len() as u64)
        }

        async fn query(&self, _filter: &MetricFilter) -> Result<Vec<MetricRecord>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }

        async fn get_by_id(&self, id: &str) -> Result<MetricRecord, StoreError> {
            Err(StoreError::NotFound { id: id.to_string() })
        }
    }

    async fn test_state() -> AppState {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let hub = Hub::with_stores(store.clone(), store, HubOptions::default());
        AppState::new(Arc::new(hub), StreamingConfig::default())
    }

    #[test]
    fn test_client_message_shapes() {
        let msg: ClientMessage = serde_json::from_str(r#"{"event":"unsubscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe));

        let msg: ClientMessage = serde_json::from_str(r#"{"event":"getHistorical"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetHistorical(None)));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"subscribe","data":{"types":["cpu"],"minValue":50}}"#).unwrap();
        match msg {
            ClientMessage::Subscribe(Some(filter)) => {
                assert_eq!(filter.types, vec!["cpu".to_string()]);
                assert_eq!(filter.min_value, Some(50.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_shapes() {
        let value = serde_json::to_value(ServerMessage::Unsubscribed).unwrap();
        assert_eq!(value, json!({"event": "unsubscribed"}));

        let value = serde_json::to_value(ServerMessage::error("boom")).unwrap();
        assert_eq!(value, json!({"event": "error", "data": {"message": "boom"}}));
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe() {
        let state = test_state().await;
        let conn = ConnectionId::new();
        let mut active = None;

        let replies = handle_client_text(&state, conn, &mut active, r#"{"event":"subscribe","data":{"types":["cpu"]}}"#).await;
        assert!(matches!(replies.as_slice(), [ServerMessage::Subscribed { .. }]));
        assert!(state.hub.metric_sessions.is_attached(conn));

        state
            .hub
            .metrics
            .record_metric(MetricRecord::new(MetricType::Memory, 10.0, "%"));
        state.hub.metrics.record_metric(MetricRecord::new(MetricType::Cpu, 20.0, "%"));

        let delivery = next_delivery(&mut active).await.unwrap();
        match delivery_message(delivery) {
            (ServerMessage::Metric(record), false) => assert_eq!(record.metric_type, MetricType::Cpu),
            other => panic!("unexpected delivery: {:?}", other.0),
        }

        let replies = handle_client_text(&state, conn, &mut active, r#"{"event":"unsubscribe"}"#).await;
        assert!(matches!(replies.as_slice(), [ServerMessage::Unsubscribed]));
        assert!(active.is_none());
        assert!(!state.hub.metric_sessions.is_attached(conn));
        assert_eq!(state.hub.metrics.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_one_session() {
        let state = test_state().await;
        let conn = ConnectionId::new();
        let mut active = None;

        handle_client_text(&state, conn, &mut active, r#"{"event":"subscribe"}"#).await;
        handle_client_text(&state, conn, &mut active, r#"{"event":"subscribe","data":{"types":["memory"]}}"#).await;

        assert_eq!(state.hub.metric_sessions.count(), 1);
        assert_eq!(state.hub.metrics.bus().subscriber_count(), 1);
        assert!(state.hub.metric_sessions.is_attached(conn));
    }

    #[tokio::test]
    async fn test_invalid_message_reports_error() {
        let state = test_state().await;
        let mut active = None;
        let replies = handle_client_text(&state, ConnectionId::new(), &mut active, "not json").await;
        assert!(matches!(replies.as_slice(), [ServerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn test_historical_defaults_to_cpu_and_memory() {
        let state = test_state().await;
        for (metric_type, value) in [(MetricType::Cpu, 1.0), (MetricType::Memory, 2.0), (MetricType::QueueSize, 3.0)] {
            state.hub.metrics.record_metric(MetricRecord::new(metric_type, value, ""));
        }
        state.hub.shutdown().await;

        let mut active = None;
        let replies = handle_client_text(&state, ConnectionId::new(), &mut active, r#"{"event":"getHistorical"}"#).await;
        match replies.as_slice() {
            [ServerMessage::Historical(records)] => {
                assert_eq!(records.len(), 2);
                assert!(records.iter().all(|r| r.metric_type != MetricType::QueueSize));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_historical_query_times_out() {
        let logs = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let hub = Hub::with_stores(logs, Arc::new(StalledStore), HubOptions::default());
        let streaming = StreamingConfig {
            historical_timeout_secs: 1,
            ..StreamingConfig::default()
        };
        let state = AppState::new(Arc::new(hub), streaming);

        let mut active = None;
        let started = std::time::Instant::now();
        let replies = handle_client_text(&state, ConnectionId::new(), &mut active, r#"{"event":"getHistorical"}"#).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match replies.as_slice() {
            [ServerMessage::Error { message }] => assert!(message.contains("timed out")),
            other => panic!("unexpected replies: {:?}", other),
        }
    }
}
