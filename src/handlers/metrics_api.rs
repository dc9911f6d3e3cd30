use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde_json::{json, Value};

use super::sse::stream_session;
use super::AppState;
use crate::config::validate_thresholds;
use crate::error::AppError;
use crate::observability::filter::MetricFilterParams;
use crate::observability::{MetricRecord, MetricThreshold};

/// GET /api/v1/metrics - history, newest first
///
/// Example: GET /api/v1/metrics?type=cpu,memory&minValue=50&tags=region:eu
pub async fn list_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricFilterParams>,
) -> Result<Json<Vec<MetricRecord>>, AppError> {
    let filter = params.into_filter();
    let metrics = state.bounded_query(state.hub.metrics.query(&filter)).await?;
    Ok(Json(metrics))
}

/// GET /api/v1/metrics/stream - live SSE
pub async fn stream_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricFilterParams>,
) -> impl IntoResponse {
    stream_session(&state.hub.metric_sessions, params.into_filter(), state.streaming.keepalive())
}

/// GET /api/v1/metrics/{id}
pub async fn get_metric(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MetricRecord>, AppError> {
    Ok(Json(state.hub.metrics.get_by_id(&id).await?))
}

/// POST /api/v1/metrics
pub async fn record_metric(State(state): State<AppState>, Json(metric): Json<MetricRecord>) -> Json<Value> {
    state.hub.metrics.record_metric(metric);
    Json(json!({ "success": true }))
}

/// GET /api/v1/metrics/thresholds
pub async fn get_thresholds(State(state): State<AppState>) -> Json<Vec<MetricThreshold>> {
    Json(state.hub.metrics.get_thresholds())
}

/// POST /api/v1/metrics/thresholds - replace the whole table
pub async fn set_thresholds(
    State(state): State<AppState>,
    Json(thresholds): Json<Vec<MetricThreshold>>,
) -> Result<Json<Value>, AppError> {
    validate_thresholds(&thresholds).map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.hub.metrics.set_thresholds(thresholds);
    Ok(Json(json!({ "success": true })))
}
