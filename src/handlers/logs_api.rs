//! Log HTTP API
//!
//! History queries read the store; `/stream` attaches a live SSE session.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;

use super::sse::stream_session;
use super::AppState;
use crate::error::AppError;
use crate::observability::filter::LogFilterParams;
use crate::observability::{AuditInfo, LogLevel, LogRecord, Payload};

/// Body of `POST /api/v1/logs`
#[derive(Debug, Deserialize)]
pub struct CreateLogRequest {
    #[serde(default)]
    pub level: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub context: Option<String>,
}

/// Body of `POST /api/v1/logs/audit`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRequest {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub level: Option<Value>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub audit: AuditInfo,
    #[serde(default)]
    pub additional_info: Option<Value>,
}

/// Level as an integer or a name; anything unrecognized is INFO
fn lenient_level(raw: Option<&Value>) -> LogLevel {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u8::try_from(n).ok()).and_then(LogLevel::from_u8),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    parsed.unwrap_or(LogLevel::Info)
}

fn payload(raw: Option<Value>) -> Payload {
    raw.map(Payload::from_json).unwrap_or_default()
}

/// GET /api/v1/logs - history, newest first
///
/// Example: GET /api/v1/logs?level=warn&context=Auth,Billing&pattern=timeout
pub async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<LogFilterParams>,
) -> Result<Json<Vec<LogRecord>>, AppError> {
    let filter = params.into_filter();
    let logs = state.bounded_query(state.hub.logs.query(&filter)).await?;
    Ok(Json(logs))
}

/// GET /api/v1/logs/stream - live SSE
pub async fn stream_logs(State(state): State<AppState>, Query(params): Query<LogFilterParams>) -> impl IntoResponse {
    stream_session(&state.hub.log_sessions, params.into_filter(), state.streaming.keepalive())
}

/// GET /api/v1/logs/{id}
pub async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<LogRecord>, AppError> {
    Ok(Json(state.hub.logs.get_by_id(&id).await?))
}

/// POST /api/v1/logs
pub async fn create_log(
    State(state): State<AppState>,
    Json(request): Json<CreateLogRequest>,
) -> (StatusCode, Json<LogRecord>) {
    let mut record = LogRecord::new(lenient_level(request.level.as_ref()), payload(request.message));
    record.context = request.context;

    let published = state.hub.logs.publish(record);
    (StatusCode::CREATED, Json(published.as_ref().clone()))
}

/// POST /api/v1/logs/audit
pub async fn create_audit_log(
    State(state): State<AppState>,
    Json(request): Json<AuditLogRequest>,
) -> (StatusCode, Json<LogRecord>) {
    let published = state.hub.logs.audit(
        payload(request.message),
        lenient_level(request.level.as_ref()),
        request.context.as_deref(),
        request.audit,
        request.additional_info,
    );
    (StatusCode::CREATED, Json(published.as_ref().clone()))
}
