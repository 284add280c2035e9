//! Benchmarks for the live ingestion pipeline.
//!
//! These benchmarks measure OTLP conversion, fan-out through the pipeline
//! (stores, trace and session aggregation) and broadcast cost per subscriber.

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, ResourceSpans, ScopeSpans, Span, Status};

use sidereal_live::broadcast::Broadcaster;
use sidereal_live::ingest::convert_traces;
use sidereal_live::model::SpanRecord;
use sidereal_live::{LiveConfig, LiveTelemetry};

fn string_kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn int_kv(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

fn sample_span(i: usize) -> Span {
    let id = (i as u64 + 1).to_be_bytes();
    Span {
        trace_id: [id, id].concat(),
        span_id: id.to_vec(),
        name: format!("chat-{i}"),
        kind: span::SpanKind::Client as i32,
        start_time_unix_nano: 1_704_067_200_000_000_000,
        end_time_unix_nano: 1_704_067_201_000_000_000,
        attributes: vec![
            string_kv("session.id", &format!("session-{}", i % 16)),
            string_kv("gen_ai.request.model", "bench-model"),
            int_kv("gen_ai.usage.input_tokens", 120),
            int_kv("gen_ai.usage.output_tokens", 40),
        ],
        status: Some(Status {
            code: 1,
            message: String::new(),
        }),
        ..Default::default()
    }
}

fn trace_request(span_count: usize) -> ExportTraceServiceRequest {
    let spans: Vec<_> = (0..span_count).map(sample_span).collect();
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![string_kv("service.name", "bench-service")],
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

fn bench_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert");

    for batch_size in [10, 100, 1000] {
        let request = trace_request(batch_size);
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("spans", batch_size),
            &request,
            |b, request| b.iter(|| black_box(convert_traces(request))),
        );
    }

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for batch_size in [10, 100, 1000] {
        let records = convert_traces(&trace_request(batch_size)).records;
        group.throughput(Throughput::Elements(batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("no_subscribers", batch_size),
            &records,
            |b, records| {
                b.iter_batched(
                    || {
                        (
                            LiveTelemetry::new(LiveConfig::default()),
                            records.clone(),
                        )
                    },
                    |(live, records)| black_box(live.ingest_spans(records)),
                    BatchSize::SmallInput,
                );
            },
        );

        group.bench_with_input(
            BenchmarkId::new("one_subscriber", batch_size),
            &records,
            |b, records| {
                b.iter_batched(
                    || {
                        let live = LiveTelemetry::new(LiveConfig::default());
                        let sub = live.subscribe();
                        (live, sub, records.clone())
                    },
                    |(live, _sub, records)| black_box(live.ingest_spans(records)),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let payload = Arc::new(convert_traces(&trace_request(10)).records);

    for subscribers in [1, 10, 100] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(BenchmarkId::new("publish", subscribers), |b| {
            b.iter_batched(
                || {
                    let broadcaster = Broadcaster::<Arc<Vec<SpanRecord>>>::new("bench", 1024);
                    let subs: Vec<_> = (0..subscribers).map(|_| broadcaster.subscribe()).collect();
                    (broadcaster, subs)
                },
                |(broadcaster, _subs)| black_box(broadcaster.publish(&payload)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_convert, bench_ingest, bench_broadcast);
criterion_main!(benches);
