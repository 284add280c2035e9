//! JSON query routes over stores and aggregators.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{ApiError, ApiState, ListResponse};
use crate::model::{LogRecord, MetricRecord, SpanRecord, TraceId};
use crate::pipeline::LiveStats;
use crate::sessions::{RunStatus, SessionQuery, SessionStatus};
use crate::store::TelemetryStore;
use crate::traces::{TraceQuery, TraceSummary, TraceTree};

/// Default result limit when a request does not set one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Upper bound on any requested limit.
pub const MAX_QUERY_LIMIT: usize = 1000;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
}

fn parse_trace_id(raw: &str) -> Result<TraceId, ApiError> {
    raw.parse::<TraceId>().map_err(ApiError::from)
}

/// Newest-first listing, or with `after` set, an oldest-first replay of the
/// entries stored since that sequence.
fn select<T, F>(
    store: &TelemetryStore<T>,
    after: Option<u64>,
    limit: usize,
    predicate: F,
) -> ListResponse<Arc<T>>
where
    F: FnMut(&T) -> bool,
{
    match after {
        None => {
            let entries = store.query(predicate, limit);
            entries.into_iter().map(|e| e.record).collect::<Vec<_>>().into()
        }
        Some(after) => {
            let (entries, cursor) = store.replay(after, predicate, limit);
            let mut page: ListResponse<Arc<T>> =
                entries.into_iter().map(|e| e.record).collect::<Vec<_>>().into();
            page.next_after = Some(cursor);
            page
        }
    }
}

pub(super) fn query_routes() -> Router<ApiState> {
    Router::new()
        .route("/spans", get(handle_spans))
        .route("/metrics", get(handle_metrics))
        .route("/logs", get(handle_logs))
        .route("/traces", get(handle_traces))
        .route("/traces/:trace_id", get(handle_trace))
        .route("/sessions", get(handle_sessions))
        .route("/sessions/:session_id", get(handle_session))
        .route("/sessions/:session_id/spans", get(handle_session_spans))
        .route("/stats", get(handle_stats))
}

#[derive(Debug, Default, Deserialize)]
pub struct SpanParams {
    pub service: Option<String>,
    pub trace_id: Option<String>,
    /// Substring of the span name.
    pub name: Option<String>,
    #[serde(default)]
    pub errors_only: bool,
    pub limit: Option<usize>,
    /// Replay spans stored after this sequence, oldest first.
    pub after: Option<u64>,
}

#[tracing::instrument(skip(state))]
async fn handle_spans(
    State(state): State<ApiState>,
    Query(params): Query<SpanParams>,
) -> Result<Json<ListResponse<Arc<SpanRecord>>>, ApiError> {
    let trace_id = params.trace_id.as_deref().map(parse_trace_id).transpose()?;

    let spans = select(
        state.live.spans(),
        params.after,
        clamp_limit(params.limit),
        |span| {
            params
                .service
                .as_deref()
                .map_or(true, |s| span.service_name == s)
                && trace_id.map_or(true, |t| span.trace_id == t)
                && params
                    .name
                    .as_deref()
                    .map_or(true, |n| span.name.contains(n))
                && (!params.errors_only || span.is_error())
        },
    );
    Ok(Json(spans))
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricParams {
    pub name: Option<String>,
    pub service: Option<String>,
    pub limit: Option<usize>,
    pub after: Option<u64>,
}

#[tracing::instrument(skip(state))]
async fn handle_metrics(
    State(state): State<ApiState>,
    Query(params): Query<MetricParams>,
) -> Json<ListResponse<Arc<MetricRecord>>> {
    Json(select(
        state.live.metrics(),
        params.after,
        clamp_limit(params.limit),
        |point| {
            params.name.as_deref().map_or(true, |n| point.name == n)
                && params
                    .service
                    .as_deref()
                    .map_or(true, |s| point.service_name == s)
        },
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub service: Option<String>,
    pub trace_id: Option<String>,
    pub min_severity: Option<i32>,
    /// Case-insensitive substring of the body.
    pub contains: Option<String>,
    pub limit: Option<usize>,
    pub after: Option<u64>,
}

#[tracing::instrument(skip(state))]
async fn handle_logs(
    State(state): State<ApiState>,
    Query(params): Query<LogParams>,
) -> Result<Json<ListResponse<Arc<LogRecord>>>, ApiError> {
    let trace_id = params.trace_id.as_deref().map(parse_trace_id).transpose()?;
    let needle = params.contains.as_deref().map(str::to_lowercase);

    let logs = select(
        state.live.logs(),
        params.after,
        clamp_limit(params.limit),
        |log| {
            params
                .service
                .as_deref()
                .map_or(true, |s| log.service_name == s)
                && trace_id.map_or(true, |t| log.trace_id == Some(t))
                && params
                    .min_severity
                    .map_or(true, |min| log.severity_number >= min)
                && needle.as_deref().map_or(true, |n| body_contains(log, n))
        },
    );
    Ok(Json(logs))
}

fn body_contains(log: &LogRecord, needle: &str) -> bool {
    match &log.body {
        serde_json::Value::String(s) => s.to_lowercase().contains(needle),
        serde_json::Value::Null => false,
        other => other.to_string().to_lowercase().contains(needle),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceParams {
    pub service: Option<String>,
    pub has_errors: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[tracing::instrument(skip(state))]
async fn handle_traces(
    State(state): State<ApiState>,
    Query(params): Query<TraceParams>,
) -> Json<ListResponse<TraceSummary>> {
    let query = TraceQuery {
        service: params.service,
        has_errors: params.has_errors,
        limit: clamp_limit(params.limit),
        offset: params.offset.unwrap_or(0),
    };
    Json(state.live.traces().recent(&query).into())
}

#[tracing::instrument(skip(state))]
async fn handle_trace(
    State(state): State<ApiState>,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceTree>, ApiError> {
    let trace_id = parse_trace_id(&trace_id)?;
    state
        .live
        .traces()
        .get_trace_tree(&trace_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("trace {trace_id} not found")))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    pub status: Option<String>,
    pub service: Option<String>,
    pub trace_id: Option<String>,
    pub has_errors: Option<bool>,
    pub min_tokens: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[tracing::instrument(skip(state))]
async fn handle_sessions(
    State(state): State<ApiState>,
    Query(params): Query<SessionParams>,
) -> Result<Json<ListResponse<SessionStatus>>, ApiError> {
    let query = SessionQuery {
        status: params
            .status
            .as_deref()
            .map(str::parse::<RunStatus>)
            .transpose()?,
        service: params.service,
        trace_id: params.trace_id.as_deref().map(parse_trace_id).transpose()?,
        has_errors: params.has_errors,
        min_tokens: params.min_tokens,
        limit: clamp_limit(params.limit),
        offset: params.offset.unwrap_or(0),
    };
    Ok(Json(state.live.sessions().list(&query).into()))
}

#[tracing::instrument(skip(state))]
async fn handle_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    state
        .live
        .sessions()
        .get_status(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id} not found")))
}

#[tracing::instrument(skip(state))]
async fn handle_session_spans(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<ListResponse<Arc<SpanRecord>>>, ApiError> {
    state
        .live
        .sessions()
        .spans(&session_id)
        .map(|spans| Json(spans.into()))
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id} not found")))
}

async fn handle_stats(State(state): State<ApiState>) -> Json<LiveStats> {
    Json(state.live.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{api_router, test_support::get};
    use crate::config::LiveConfig;
    use crate::model::StatusCode as SpanStatusCode;
    use crate::pipeline::LiveTelemetry;
    use crate::test_fixtures::{log, metric, span, span_with_attrs};
    use axum::http::StatusCode;
    use serde_json::json;

    fn router_with_data() -> axum::Router {
        let live = Arc::new(LiveTelemetry::new(LiveConfig::default()));
        let mut failing = span(1, 2, Some(1), 200);
        failing.status.code = SpanStatusCode::Error;
        live.ingest_spans(vec![span(1, 1, None, 100), failing]);
        live.ingest_spans(vec![span_with_attrs(
            2,
            1,
            &[
                ("session.id", json!("run-42")),
                ("gen_ai.usage.input_tokens", json!(12)),
            ],
        )]);
        live.ingest_metrics(vec![metric("requests", 1.0), metric("latency", 2.0)]);
        live.ingest_logs(vec![log("Hello World", Some(1)), log("other", None)]);
        api_router(ApiState::new(live))
    }

    #[tokio::test]
    async fn spans_newest_first_with_filters() {
        let router = router_with_data();

        let (status, body) = get(&router, "/api/v1/spans").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (_, body) = get(&router, "/api/v1/spans?errors_only=true").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["name"], "span-02");

        let trace = TraceId::from([2; 16]).to_hex();
        let (_, body) = get(&router, &format!("/api/v1/spans?trace_id={trace}&limit=5")).await;
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn after_replays_oldest_first_with_cursor() {
        let router = router_with_data();

        let (_, body) = get(&router, "/api/v1/spans").await;
        assert!(body.get("next_after").is_none());

        let (status, body) = get(&router, "/api/v1/spans?after=0&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"][0]["name"], "span-01");
        assert_eq!(body["next_after"], 2);

        let (_, body) = get(&router, "/api/v1/spans?after=2").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["next_after"], 3);

        let (_, body) = get(&router, "/api/v1/spans?after=3").await;
        assert_eq!(body["count"], 0);
        assert_eq!(body["next_after"], 3);

        let (_, body) = get(&router, "/api/v1/logs?after=1").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["body"], "other");

        let (status, _) = get(&router, "/api/v1/metrics?after=minus-one").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_trace_id_is_400() {
        let router = router_with_data();
        let (status, body) = get(&router, "/api/v1/traces/not-hex").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = get(&router, "/api/v1/spans?trace_id=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_trace_is_404() {
        let router = router_with_data();
        let missing = TraceId::from([9; 16]).to_hex();
        let (status, body) = get(&router, &format!("/api/v1/traces/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains(&missing));
    }

    #[tokio::test]
    async fn trace_tree_and_listing() {
        let router = router_with_data();
        let trace = TraceId::from([1; 16]).to_hex();

        let (status, body) = get(&router, &format!("/api/v1/traces/{trace}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["span_count"], 2);
        assert_eq!(body["roots"][0]["children"].as_array().unwrap().len(), 1);

        let (_, body) = get(&router, "/api/v1/traces?has_errors=true").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["trace_id"], trace);
    }

    #[tokio::test]
    async fn sessions_routes() {
        let router = router_with_data();

        let (status, body) = get(&router, "/api/v1/sessions/run-42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_tokens"], 12);
        assert_eq!(body["status"], "running");

        let (_, body) = get(&router, "/api/v1/sessions/run-42/spans").await;
        assert_eq!(body["count"], 1);

        let (_, body) = get(&router, "/api/v1/sessions?min_tokens=10").await;
        assert_eq!(body["count"], 1);

        let (status, _) = get(&router, "/api/v1/sessions?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(&router, "/api/v1/sessions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&router, "/api/v1/sessions/nope/spans").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_and_logs_filters() {
        let router = router_with_data();

        let (_, body) = get(&router, "/api/v1/metrics?name=latency").await;
        assert_eq!(body["count"], 1);

        let (_, body) = get(&router, "/api/v1/logs?contains=hello").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["body"], "Hello World");
    }

    #[tokio::test]
    async fn stats_and_health() {
        let router = router_with_data();

        let (status, body) = get(&router, "/api/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["spans"]["len"], 3);
        assert_eq!(body["traces"], 2);
        assert_eq!(body["sessions"]["tracked_sessions"], 2);

        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_QUERY_LIMIT);
        assert_eq!(clamp_limit(Some(5)), 5);
        assert_eq!(clamp_limit(Some(1_000_000)), MAX_QUERY_LIMIT);
    }
}
