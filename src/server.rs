use anyhow::Result;
use axum::{extract::DefaultBodyLimit, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    handlers::{self, AppState},
    metrics,
    observability::Hub,
    signals::setup_signal_handlers,
};

/// Start the telemetry bus server
///
/// This function:
/// 1. Initializes metrics
/// 2. Opens the store and starts the hub
/// 3. Sets up signal handlers for graceful shutdown and threshold reload
/// 4. Serves requests until a shutdown signal, then completes every stream
pub async fn start_server(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let hub = Arc::new(Hub::start(&config).await?);

    let (shutdown_tx, signal_handle) = setup_signal_handlers(config_path, hub.metrics.clone());
    let mut shutdown_rx = shutdown_tx.subscribe();

    let state = AppState::new(hub.clone(), config.streaming.clone());
    let app = create_router(state, metrics_handle);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("Starting telemetry bus on {}", addr);
    info!(
        "Configuration: database {}, subscriber capacity {}, {} thresholds, collector {}",
        config.storage.database_url,
        config.bus.subscriber_capacity,
        config.thresholds.len(),
        if config.collector.enabled { "enabled" } else { "disabled" }
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, completing streams and draining writers...");
            // Open SSE responses only end once their bus completes
            shutdown_hub.shutdown().await;
        })
        .await?;

    signal_handle.abort();
    hub.shutdown().await;
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState, metrics_handle: Arc<PrometheusHandle>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/v1/logs",
            get(handlers::logs_api::list_logs).post(handlers::logs_api::create_log),
        )
        .route("/api/v1/logs/stream", get(handlers::logs_api::stream_logs))
        .route(
            "/api/v1/logs/audit",
            axum::routing::post(handlers::logs_api::create_audit_log),
        )
        .route("/api/v1/logs/:id", get(handlers::logs_api::get_log))
        .route(
            "/api/v1/metrics",
            get(handlers::metrics_api::list_metrics).post(handlers::metrics_api::record_metric),
        )
        .route("/api/v1/metrics/stream", get(handlers::metrics_api::stream_metrics))
        .route(
            "/api/v1/metrics/thresholds",
            get(handlers::metrics_api::get_thresholds).post(handlers::metrics_api::set_thresholds),
        )
        .route("/api/v1/metrics/ws", get(handlers::ws::metrics_ws))
        .route("/api/v1/metrics/:id", get(handlers::metrics_api::get_metric))
        .with_state(state);

    Router::new()
        .route("/metrics", get(handlers::metrics_handler::prometheus_metrics))
        .with_state(metrics_handle)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
