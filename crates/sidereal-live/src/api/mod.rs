//! HTTP API over the live state.
//!
//! All routes live under `/api/v1`: JSON queries, the live SSE stream and the
//! browser console bridge.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::pipeline::LiveTelemetry;
use crate::LiveError;

pub mod console;
pub mod live;
pub mod query;

pub use query::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub live: Arc<LiveTelemetry>,
}

impl ApiState {
    pub const fn new(live: Arc<LiveTelemetry>) -> Self {
        Self { live }
    }
}

/// Create the `/api/v1` router.
pub fn api_router(state: ApiState) -> Router {
    let v1 = Router::new()
        .merge(query::query_routes())
        .merge(live::live_routes())
        .nest("/console", console::console_routes())
        .with_state(state);

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/v1", v1)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    NotFound(String),
}

impl From<LiveError> for ApiError {
    fn from(err: LiveError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

/// Envelope for list responses.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub data: Vec<T>,
    /// Pass back as `after` to continue a replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<u64>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            count: data.len(),
            data,
            next_after: None,
        }
    }
}
