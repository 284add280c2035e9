//! Record builders and rstest fixtures shared by unit tests.
//!
//! ```text
//! test_config
//!    └── test_live
//! ```

use std::sync::Arc;

use rstest::fixture;
use serde_json::Value;

use crate::config::LiveConfig;
use crate::model::{
    Attributes, LogRecord, MetricKind, MetricRecord, MetricValue, SpanId, SpanKind, SpanRecord,
    SpanStatus, TraceId,
};
use crate::pipeline::LiveTelemetry;

pub const SERVICE: &str = "test-service";

/// Small bounds so eviction paths are easy to reach.
#[fixture]
pub fn test_config() -> LiveConfig {
    let mut config = LiveConfig::default();
    config.store.span_capacity = 100;
    config.store.metric_capacity = 100;
    config.store.log_capacity = 100;
    config.broadcast.subscriber_queue = 16;
    config
}

#[fixture]
pub fn test_live(test_config: LiveConfig) -> Arc<LiveTelemetry> {
    Arc::new(LiveTelemetry::new(test_config))
}

fn resource() -> Attributes {
    Attributes::from([("service.name".to_owned(), Value::from(SERVICE))])
}

/// A finished span lasting 50ns. Identifiers repeat the given byte.
pub fn span(trace: u8, id: u8, parent: Option<u8>, start: u64) -> SpanRecord {
    SpanRecord {
        trace_id: TraceId::from([trace; 16]),
        span_id: SpanId::from([id; 8]),
        parent_span_id: parent.map(|p| SpanId::from([p; 8])),
        name: format!("span-{id:02x}"),
        kind: SpanKind::Internal,
        start_time_unix_nano: start,
        end_time_unix_nano: start + 50,
        status: SpanStatus::default(),
        service_name: SERVICE.to_owned(),
        scope_name: None,
        scope_version: None,
        resource: resource(),
        attributes: resource(),
        events: Vec::new(),
        links: Vec::new(),
    }
}

/// A root span carrying extra attributes on top of the resource.
pub fn span_with_attrs(trace: u8, id: u8, attrs: &[(&str, Value)]) -> SpanRecord {
    let mut record = span(trace, id, None, 1_000);
    record.attributes.extend(
        attrs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone())),
    );
    record
}

pub fn log(body: &str, trace: Option<u8>) -> LogRecord {
    LogRecord {
        time_unix_nano: 1_000,
        observed_time_unix_nano: 1_000,
        severity_number: 9,
        severity_text: "INFO".to_owned(),
        body: Value::from(body),
        trace_id: trace.map(|t| TraceId::from([t; 16])),
        span_id: None,
        service_name: SERVICE.to_owned(),
        scope_name: None,
        resource: resource(),
        attributes: resource(),
    }
}

pub fn metric(name: &str, value: f64) -> MetricRecord {
    MetricRecord {
        name: name.to_owned(),
        description: String::new(),
        unit: "1".to_owned(),
        kind: MetricKind::Gauge,
        is_monotonic: None,
        start_time_unix_nano: 0,
        time_unix_nano: 1_000,
        value: MetricValue::Number { value },
        exemplar_trace_id: None,
        exemplar_span_id: None,
        service_name: SERVICE.to_owned(),
        scope_name: None,
        resource: resource(),
        attributes: resource(),
    }
}
