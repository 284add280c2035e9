//! Integration tests for the live telemetry pipeline.
//!
//! Tests the full flow: OTLP request -> conversion -> stores and aggregators
//! -> query API and live subscribers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use axum::Router;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{status, ResourceSpans, ScopeSpans, Span, Status};
use prost::Message;
use rstest::{fixture, rstest};
use tower::ServiceExt;

use sidereal_live::api::{api_router, ApiState};
use sidereal_live::console::{ConsoleIngest, ConsoleLevel, ConsoleQuery};
use sidereal_live::ingest::{otlp_http_router, OtlpHttpState};
use sidereal_live::pipeline::TelemetryEvent;
use sidereal_live::sessions::RunStatus;
use sidereal_live::{LiveConfig, LiveTelemetry};

// ============================================================================
// Fixtures
// ============================================================================

#[fixture]
fn live() -> Arc<LiveTelemetry> {
    Arc::new(LiveTelemetry::new(LiveConfig::default()))
}

fn kv(key: &str, value: any_value::Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

fn str_kv(key: &str, value: &str) -> KeyValue {
    kv(key, any_value::Value::StringValue(value.to_string()))
}

fn int_kv(key: &str, value: i64) -> KeyValue {
    kv(key, any_value::Value::IntValue(value))
}

fn otlp_span(trace: u8, id: u8, parent: Option<u8>, attributes: Vec<KeyValue>) -> Span {
    Span {
        trace_id: vec![trace; 16],
        span_id: vec![id; 8],
        parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
        name: format!("op-{id}"),
        start_time_unix_nano: 1_000_000_000 + u64::from(id) * 1_000,
        end_time_unix_nano: 1_000_000_000 + u64::from(id) * 1_000 + 500,
        attributes,
        ..Default::default()
    }
}

fn trace_request(service: &str, spans: Vec<Span>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![str_kv("service.name", service)],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

async fn post_protobuf(router: &Router, uri: &str, body: Vec<u8>) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(Body::from(body))
        .unwrap();
    router.clone().oneshot(request).await.unwrap().status()
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or_default())
}

// ============================================================================
// End to end
// ============================================================================

#[rstest]
#[tokio::test]
async fn otlp_http_spans_are_queryable_as_trace_and_session(live: Arc<LiveTelemetry>) {
    let otlp = otlp_http_router(OtlpHttpState::new(Arc::clone(&live)));
    let api = api_router(ApiState::new(Arc::clone(&live)));

    let mut failing = otlp_span(
        7,
        3,
        Some(2),
        vec![
            str_kv("session.id", "agent-run-1"),
            str_kv("gen_ai.operation.name", "execute_tool"),
        ],
    );
    failing.status = Some(Status {
        code: status::StatusCode::Error as i32,
        message: "tool timed out".to_string(),
    });

    let request = trace_request(
        "agent",
        vec![
            otlp_span(
                7,
                1,
                None,
                vec![
                    str_kv("session.id", "agent-run-1"),
                    str_kv("gen_ai.request.model", "model-a"),
                    int_kv("gen_ai.usage.input_tokens", 100),
                    int_kv("gen_ai.usage.output_tokens", 25),
                ],
            ),
            otlp_span(
                7,
                2,
                Some(1),
                vec![
                    str_kv("session.id", "agent-run-1"),
                    int_kv("gen_ai.usage.input_tokens", 10),
                ],
            ),
            failing,
        ],
    );
    let status = post_protobuf(&otlp, "/v1/traces", request.encode_to_vec()).await;
    assert_eq!(status, StatusCode::OK);

    let trace = hex::encode([7u8; 16]);
    let (status, tree) = get_json(&api, &format!("/api/v1/traces/{trace}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["span_count"], 3);
    assert_eq!(tree["roots"].as_array().unwrap().len(), 1);
    assert_eq!(tree["roots"][0]["children"][0]["children"].as_array().unwrap().len(), 1);

    let (status, session) = get_json(&api, "/api/v1/sessions/agent-run-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["span_count"], 3);
    assert_eq!(session["input_tokens"], 110);
    assert_eq!(session["output_tokens"], 25);
    assert_eq!(session["total_tokens"], 135);
    assert_eq!(session["tool_calls"], 1);
    assert_eq!(session["error_count"], 1);
    assert_eq!(session["errors"][0]["message"], "tool timed out");
    assert_eq!(session["primary_model"], "model-a");
    assert_eq!(session["services"][0], "agent");

    let (_, spans) = get_json(&api, "/api/v1/spans?service=agent&errors_only=true").await;
    assert_eq!(spans["count"], 1);
}

#[rstest]
#[tokio::test]
async fn explicit_status_closes_session(live: Arc<LiveTelemetry>) {
    let otlp = otlp_http_router(OtlpHttpState::new(Arc::clone(&live)));
    let mut sub = live.subscribe();

    let request = trace_request(
        "agent",
        vec![otlp_span(
            1,
            1,
            None,
            vec![
                str_kv("agent.run.id", "run-9"),
                str_kv("agent.run.status", "completed"),
            ],
        )],
    );
    post_protobuf(&otlp, "/v1/traces", request.encode_to_vec()).await;

    assert!(matches!(sub.recv().await, Some(TelemetryEvent::Spans(_))));
    let Some(TelemetryEvent::Session(status)) = sub.recv().await else {
        panic!("expected a session update after spans");
    };
    assert_eq!(status.session_id, "run-9");
    assert_eq!(status.status, RunStatus::Succeeded);
}

// ============================================================================
// Broadcast isolation
// ============================================================================

#[tokio::test]
async fn slow_subscriber_does_not_starve_fast_one() {
    let mut config = LiveConfig::default();
    config.broadcast.subscriber_queue = 2;
    let live = LiveTelemetry::new(config);

    let mut fast = live.subscribe();
    let mut slow = live.subscribe();

    let mut fast_received = 0;
    for i in 0..10u8 {
        let request = trace_request("svc", vec![otlp_span(i + 1, 1, None, vec![])]);
        let records = sidereal_live::ingest::convert_traces(&request).records;
        live.ingest_spans(records);
        // Spans plus one session update per batch.
        while fast.try_recv().is_some() {
            fast_received += 1;
        }
    }

    assert_eq!(fast_received, 20);

    let mut slow_received = 0;
    while slow.try_recv().is_some() {
        slow_received += 1;
    }
    assert_eq!(slow_received, 2);
    assert_eq!(live.stats().dropped_events, 18);
    assert_eq!(live.spans().len(), 10);
}

#[rstest]
#[tokio::test]
async fn dropped_subscription_unregisters(live: Arc<LiveTelemetry>) {
    let first = live.subscribe();
    let second = live.subscribe();
    assert_eq!(live.subscriber_count(), 2);

    drop(first);
    assert_eq!(live.subscriber_count(), 1);
    drop(second);
    assert_eq!(live.subscriber_count(), 0);
}

// ============================================================================
// Console bridge
// ============================================================================

#[rstest]
#[tokio::test]
async fn console_entries_are_newest_first_and_streamed(live: Arc<LiveTelemetry>) {
    let mut sub = live.console().subscribe();

    for (level, message) in [("info", "boot"), ("warn", "slow"), ("error", "crash")] {
        live.console().ingest(ConsoleIngest {
            level: Some(level.to_string()),
            message: message.to_string(),
            session_id: Some("tab".to_string()),
            ..Default::default()
        });
    }

    let all = live.console().query(&ConsoleQuery {
        limit: 10,
        ..Default::default()
    });
    let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, ["crash", "slow", "boot"]);

    let errors = live.console().errors(10);
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.level >= ConsoleLevel::Warn));

    for expected in ["boot", "slow", "crash"] {
        assert_eq!(sub.recv().await.unwrap().message, expected);
    }
}

// ============================================================================
// Session statistics
// ============================================================================

#[rstest]
#[tokio::test]
async fn statistics_sum_across_sessions(live: Arc<LiveTelemetry>) {
    let api = api_router(ApiState::new(Arc::clone(&live)));

    for (trace, session, tokens) in [(1u8, "a", 5i64), (2, "b", 7), (3, "a", 11)] {
        let request = trace_request(
            "svc",
            vec![otlp_span(
                trace,
                1,
                None,
                vec![
                    str_kv("session.id", session),
                    int_kv("gen_ai.usage.input_tokens", tokens),
                    str_kv("gen_ai.request.model", "m"),
                ],
            )],
        );
        live.ingest_spans(sidereal_live::ingest::convert_traces(&request).records);
    }

    let (_, a) = get_json(&api, "/api/v1/sessions/a").await;
    let (_, b) = get_json(&api, "/api/v1/sessions/b").await;
    assert_eq!(a["total_tokens"], 16);
    assert_eq!(b["total_tokens"], 7);

    let (_, stats) = get_json(&api, "/api/v1/stats").await;
    assert_eq!(stats["sessions"]["tracked_sessions"], 2);
    assert_eq!(stats["sessions"]["total_tokens"], 23);
    assert_eq!(stats["sessions"]["top_models"][0]["model"], "m");
    assert_eq!(stats["sessions"]["top_models"][0]["count"], 3);
    assert_eq!(stats["traces"], 3);
}
