//! axum HTTP OTLP receivers.
//!
//! Accepts protobuf (`application/x-protobuf`) and JSON (`application/json`)
//! bodies on `/v1/traces`, `/v1/metrics` and `/v1/logs`. Gzip-compressed
//! bodies are decompressed by tower-http before they reach the handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use opentelemetry_proto::tonic::collector::{
    logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse},
    metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse},
    trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse},
};
use prost::Message;
use serde::{de::DeserializeOwned, Serialize};
use tower_http::decompression::RequestDecompressionLayer;

use super::export::{export_logs, export_metrics, export_traces};
use crate::config::{DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_RECORDS_PER_REQUEST};
use crate::pipeline::LiveTelemetry;
use crate::LiveError;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct OtlpHttpState {
    pub live: Arc<LiveTelemetry>,
    pub max_records_per_request: usize,
}

impl OtlpHttpState {
    pub const fn new(live: Arc<LiveTelemetry>) -> Self {
        Self {
            live,
            max_records_per_request: DEFAULT_MAX_RECORDS_PER_REQUEST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Protobuf,
    Json,
}

impl WireFormat {
    /// A missing `Content-Type` is treated as protobuf; parameters such as
    /// `charset` are ignored.
    fn from_headers(headers: &HeaderMap) -> Result<Self, LiveError> {
        let Some(value) = headers.get(CONTENT_TYPE) else {
            return Ok(Self::Protobuf);
        };
        let raw = value.to_str().unwrap_or_default();
        let mime = raw.split(';').next().unwrap_or_default().trim();
        match mime {
            "application/x-protobuf" | "application/protobuf" => Ok(Self::Protobuf),
            "application/json" => Ok(Self::Json),
            _ => Err(LiveError::InvalidContentType {
                content_type: raw.to_owned(),
            }),
        }
    }

    const fn mime(self) -> &'static str {
        match self {
            Self::Protobuf => "application/x-protobuf",
            Self::Json => "application/json",
        }
    }
}

/// Create the OTLP HTTP router with the default body size limit.
pub fn otlp_http_router(state: OtlpHttpState) -> Router {
    otlp_http_router_with_limit(state, DEFAULT_MAX_BODY_BYTES)
}

/// Create the OTLP HTTP router with a custom body size limit.
///
/// The limit applies to the decompressed body.
pub fn otlp_http_router_with_limit(state: OtlpHttpState, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/traces", post(handle_traces))
        .route("/v1/metrics", post(handle_metrics))
        .route("/v1/logs", post(handle_logs))
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "ok"
}

#[tracing::instrument(skip_all, fields(signal = "traces"))]
async fn handle_traces(
    State(state): State<OtlpHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    respond(&state, &headers, &body, |live, req: &ExportTraceServiceRequest, max| {
        export_traces(live, req, max)
            .map(|partial_success| ExportTraceServiceResponse { partial_success })
    })
}

#[tracing::instrument(skip_all, fields(signal = "metrics"))]
async fn handle_metrics(
    State(state): State<OtlpHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    respond(&state, &headers, &body, |live, req: &ExportMetricsServiceRequest, max| {
        export_metrics(live, req, max)
            .map(|partial_success| ExportMetricsServiceResponse { partial_success })
    })
}

#[tracing::instrument(skip_all, fields(signal = "logs"))]
async fn handle_logs(
    State(state): State<OtlpHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    respond(&state, &headers, &body, |live, req: &ExportLogsServiceRequest, max| {
        export_logs(live, req, max)
            .map(|partial_success| ExportLogsServiceResponse { partial_success })
    })
}

/// Decode a request body, run `export` on it and encode the reply in the
/// same format the client sent.
fn respond<Req, Resp>(
    state: &OtlpHttpState,
    headers: &HeaderMap,
    body: &[u8],
    export: impl FnOnce(&LiveTelemetry, &Req, usize) -> Result<Resp, LiveError>,
) -> Result<Response, HttpError>
where
    Req: Message + Default + DeserializeOwned,
    Resp: Message + Serialize,
{
    let format = WireFormat::from_headers(headers)?;
    let request: Req = match format {
        WireFormat::Protobuf => {
            Req::decode(body).map_err(|source| LiveError::ProtoDecode { source })?
        }
        WireFormat::Json => {
            serde_json::from_slice(body).map_err(|source| LiveError::JsonDecode { source })?
        }
    };

    let reply = export(&*state.live, &request, state.max_records_per_request)?;

    let encoded = match format {
        WireFormat::Protobuf => reply.encode_to_vec(),
        WireFormat::Json => {
            serde_json::to_vec(&reply).map_err(|source| LiveError::JsonEncode { source })?
        }
    };
    Ok(([(CONTENT_TYPE, format.mime())], encoded).into_response())
}

/// Maps ingest failures onto OTLP/HTTP status codes.
pub struct HttpError(LiveError);

impl From<LiveError> for HttpError {
    fn from(err: LiveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LiveError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            LiveError::InvalidContentType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            LiveError::ProtoDecode { .. } | LiveError::JsonDecode { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "OTLP request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "OTLP request rejected");
        }

        (status, self.0.to_string()).into_response()
    }
}
