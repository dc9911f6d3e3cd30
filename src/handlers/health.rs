use axum::{extract::State, response::Json};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct BusHealth {
    pub subscribers: usize,
    pub sessions: usize,
    pub published: u64,
    pub dropped: u64,
    pub closed: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub logs: BusHealth,
    pub metrics: BusHealth,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let hub = &state.hub;
    let log_stats = hub.logs.bus().stats();
    let metric_stats = hub.metrics.bus().stats();

    let logs = BusHealth {
        subscribers: log_stats.subscribers,
        sessions: hub.log_sessions.count(),
        published: log_stats.published,
        dropped: log_stats.dropped,
        closed: hub.logs.bus().is_closed(),
    };
    let metrics = BusHealth {
        subscribers: metric_stats.subscribers,
        sessions: hub.metric_sessions.count(),
        published: metric_stats.published,
        dropped: metric_stats.dropped,
        closed: hub.metrics.bus().is_closed(),
    };

    let status = if logs.closed || metrics.closed { "stopping" } else { "ok" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        logs,
        metrics,
    })
}
