//! Server-sent event stream of live telemetry.
//!
//! Each connection holds one broadcaster subscription; the subscription is
//! dropped, and so unregistered, when the client goes away.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState};
use crate::model::Signal;
use crate::pipeline::TelemetryEvent;

pub(super) fn live_routes() -> Router<ApiState> {
    Router::new().route("/live", get(handle_live))
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveParams {
    /// `traces` (or `spans`), `metrics` or `logs`.
    pub signal: Option<String>,
    pub session: Option<String>,
}

/// Serialize `payload` as a named SSE event.
pub(super) fn json_event<T: Serialize>(name: &'static str, payload: &T) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(event = name, error = %e, "Failed to encode live event");
            None
        }
    }
}

/// Connection acknowledgement, always the first event on a stream.
#[derive(Debug, Serialize)]
pub(super) struct Connected<'a> {
    pub subscriber_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<&'a str>,
}

fn filter_event(
    event: &TelemetryEvent,
    signal: Option<Signal>,
    session: Option<&str>,
) -> Option<TelemetryEvent> {
    if signal.is_some_and(|s| s != event.signal()) {
        return None;
    }
    match session {
        Some(session) => event.for_session(session),
        None => Some(event.clone()),
    }
}

#[tracing::instrument(skip(state))]
async fn handle_live(
    State(state): State<ApiState>,
    Query(params): Query<LiveParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let signal = params
        .signal
        .as_deref()
        .map(str::parse::<Signal>)
        .transpose()?;
    let session = params.session.filter(|s| !s.is_empty());

    let subscription = state.live.subscribe();
    tracing::debug!(subscriber = subscription.id(), "Live stream opened");

    let connected = json_event(
        "connected",
        &Connected {
            subscriber_id: subscription.id(),
            signal,
            session: session.as_deref(),
        },
    )
    .unwrap_or_else(|| Event::default().event("connected"));

    let events = subscription.filter_map(move |event| {
        let out = filter_event(&event, signal, session.as_deref())
            .and_then(|event| json_event(event.event_name(), &event))
            .map(Ok);
        futures::future::ready(out)
    });

    let stream = stream::once(futures::future::ready(Ok(connected))).chain(events);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
