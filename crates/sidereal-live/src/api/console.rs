//! Browser console bridge routes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::live::{json_event, Connected};
use super::query::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
use super::{ApiError, ApiState, ListResponse};
use crate::console::{ConsoleIngest, ConsoleLevel, ConsoleLogEntry, ConsoleQuery};

pub(super) fn console_routes() -> Router<ApiState> {
    Router::new()
        .route("/", get(handle_query).post(handle_ingest))
        .route("/errors", get(handle_errors))
        .route("/live", get(handle_live))
        .route("/:id", get(handle_get))
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[tracing::instrument(skip_all)]
async fn handle_ingest(
    State(state): State<ApiState>,
    Json(input): Json<ConsoleIngest>,
) -> (StatusCode, Json<CreatedResponse>) {
    let entry = state.live.console().ingest(input);
    (
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: entry.id.clone(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleParams {
    /// Minimum level; unrecognised names mean `log`.
    pub level: Option<String>,
    pub session: Option<String>,
    pub pattern: Option<String>,
    pub limit: Option<usize>,
}

fn limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
}

#[tracing::instrument(skip(state))]
async fn handle_query(
    State(state): State<ApiState>,
    Query(params): Query<ConsoleParams>,
) -> Json<ListResponse<Arc<ConsoleLogEntry>>> {
    let query = ConsoleQuery {
        min_level: params.level.as_deref().map(ConsoleLevel::parse),
        session: params.session.filter(|s| !s.is_empty()),
        pattern: params.pattern.filter(|s| !s.is_empty()),
        limit: limit(params.limit),
    };
    Json(state.live.console().query(&query).into())
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorsParams {
    pub limit: Option<usize>,
}

#[tracing::instrument(skip(state))]
async fn handle_errors(
    State(state): State<ApiState>,
    Query(params): Query<ErrorsParams>,
) -> Json<ListResponse<Arc<ConsoleLogEntry>>> {
    Json(state.live.console().errors(limit(params.limit)).into())
}

#[tracing::instrument(skip(state))]
async fn handle_get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Arc<ConsoleLogEntry>>, ApiError> {
    state
        .live
        .console()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("console entry {id} not found")))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleLiveParams {
    pub session: Option<String>,
}

#[tracing::instrument(skip(state))]
async fn handle_live(
    State(state): State<ApiState>,
    Query(params): Query<ConsoleLiveParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = params.session.filter(|s| !s.is_empty());
    let subscription = state.live.console().subscribe();

    let connected = json_event(
        "connected",
        &Connected {
            subscriber_id: subscription.id(),
            signal: None,
            session: session.as_deref(),
        },
    )
    .unwrap_or_else(|| Event::default().event("connected"));

    let entries = subscription.filter_map(move |entry| {
        let wanted = session
            .as_deref()
            .map_or(true, |s| entry.session_id.as_deref() == Some(s));
        let out = wanted
            .then(|| json_event("console", &*entry))
            .flatten()
            .map(Ok);
        futures::future::ready(out)
    });

    let stream = stream::once(futures::future::ready(Ok(connected))).chain(entries);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
