//! REST endpoint handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use toolbatch::batch::BatchRequest;
use toolbatch::error::BatchError;
use toolbatch::service::{BatchService, ConfigSnapshot, HealthStatus, Metrics};
use tracing::warn;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const CACHE_STATUS_HEADER: &str = "x-cache-status";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BatchService>,
}

/// An error response: `{"detail": ...}` with an optional trace header.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    trace_id: Option<String>,
}

impl ApiError {
    fn from_batch(err: BatchError, trace_id: Option<String>) -> Self {
        let status = match &err {
            BatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BatchError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            BatchError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            detail: err.to_string(),
            trace_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(trace_id) = &self.trace_id {
            insert_header(&mut headers, TRACE_ID_HEADER, trace_id);
        }
        (self.status, headers, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => warn!("Dropping {name} header with non-visible characters"),
    }
}

/// POST /get_observation — Execute a batch of tool actions.
///
/// Returns the index-aligned response with trace, cache and timing headers.
/// Validation failures map to 400, the batch deadline to 408, a closed
/// admission gate to 503.
pub async fn get_observation(
    State(app): State<AppState>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        detail: e.body_text(),
        trace_id: None,
    })?;

    let requested_trace = request.trace_id.clone();
    let (response, meta) = app
        .service
        .execute(request)
        .await
        .map_err(|e| ApiError::from_batch(e, requested_trace))?;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, TRACE_ID_HEADER, &meta.trace_id);
    if let Some(status) = meta.cache.header_value() {
        insert_header(&mut headers, CACHE_STATUS_HEADER, status);
    }
    insert_header(
        &mut headers,
        PROCESSING_TIME_HEADER,
        &format!("{:.2}", meta.processing_time_ms),
    );
    Ok((headers, Json(response)).into_response())
}

/// GET /health — Liveness and a subset of the configuration.
pub async fn health(State(app): State<AppState>) -> Json<HealthStatus> {
    Json(app.service.health())
}

/// GET /metrics — Admission, cache and pool counters.
pub async fn metrics(State(app): State<AppState>) -> Json<Metrics> {
    Json(app.service.metrics())
}

/// GET /config — The resolved scheduler configuration.
pub async fn config(State(app): State<AppState>) -> Json<ConfigSnapshot> {
    Json(app.service.config())
}
