use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics - Prometheus exposition of the bus counters
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prometheus_metrics_handler() {
        let handle = Arc::new(crate::metrics::detached_handle());
        let response = prometheus_metrics(State(handle)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
