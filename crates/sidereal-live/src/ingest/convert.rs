//! OTLP proto to internal record conversion.
//!
//! Each OTLP leaf item (span, metric data point, log record) becomes one
//! record carrying its resource attributes, overlaid by the item's own
//! attributes. Conversion is lazy: the `*_records` functions return
//! iterators that yield one `Result` per item, so a malformed item is
//! skipped without affecting its neighbours.

use std::sync::Arc;

use opentelemetry_proto::tonic::{
    collector::{
        logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
        trace::v1::ExportTraceServiceRequest,
    },
    common::v1::{any_value::Value as AnyValueKind, AnyValue, InstrumentationScope, KeyValue},
    logs::v1::LogRecord as OtlpLogRecord,
    metrics::v1::{
        metric::Data, number_data_point, Exemplar, ExponentialHistogramDataPoint,
        HistogramDataPoint, Metric, NumberDataPoint, SummaryDataPoint,
    },
    resource::v1::Resource,
    trace::v1::Span,
};

use crate::model::{
    Attributes, LogRecord, MetricKind, MetricRecord, MetricValue, QuantileValue, Signal, SpanEvent,
    SpanId, SpanLink, SpanRecord, SpanStatus, TraceId,
};

const DEFAULT_SERVICE_NAME: &str = "unknown";

/// Semantic convention attribute keys.
mod semconv {
    pub const SERVICE_NAME: &str = "service.name";
}

/// A single item that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    /// A required identifier is missing, all zeros, or the wrong width.
    #[error("invalid {field}: {len} bytes")]
    InvalidId { field: &'static str, len: usize },

    /// A metric carried no data section.
    #[error("metric {name} has no data")]
    MissingMetricData { name: String },

    /// A number data point carried no value.
    #[error("metric {name} has a data point without a value")]
    MissingValue { name: String },
}

/// Result of converting an OTLP request into records.
///
/// Tracks both successfully converted records and any that were rejected
/// during conversion, allowing OTLP partial_success responses.
#[derive(Debug)]
pub struct ConversionResult<T> {
    /// The converted records, in request order.
    pub records: Vec<T>,
    /// Number of records rejected during conversion.
    pub rejected_count: i64,
    /// Human-readable error message if any records were rejected.
    pub error_message: Option<String>,
}

impl<T> ConversionResult<T> {
    /// Create a result with no rejections.
    pub const fn success(records: Vec<T>) -> Self {
        Self {
            records,
            rejected_count: 0,
            error_message: None,
        }
    }

    /// Create a result with some rejections.
    pub const fn partial(records: Vec<T>, rejected_count: i64, error_message: String) -> Self {
        Self {
            records,
            rejected_count,
            error_message: Some(error_message),
        }
    }
}

/// Resource-level context shared by every item under one resource.
#[derive(Debug)]
struct ResourceContext {
    service_name: String,
    attributes: Attributes,
}

impl ResourceContext {
    fn new(resource: Option<&Resource>) -> Arc<Self> {
        let attributes = resource
            .map(|r| attributes_to_json(&r.attributes))
            .unwrap_or_default();
        let service_name = attributes
            .get(semconv::SERVICE_NAME)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVICE_NAME)
            .to_owned();
        Arc::new(Self {
            service_name,
            attributes,
        })
    }

    /// Resource attributes overlaid with item attributes (item wins).
    fn merge(&self, item: &[KeyValue]) -> Attributes {
        let mut merged = self.attributes.clone();
        merged.extend(attributes_to_json(item));
        merged
    }
}

fn scope_parts(scope: Option<&InstrumentationScope>) -> (Option<String>, Option<String>) {
    match scope {
        Some(s) => (
            Some(s.name.clone()).filter(|n| !n.is_empty()),
            Some(s.version.clone()).filter(|v| !v.is_empty()),
        ),
        None => (None, None),
    }
}

// ============================================================================
// Traces
// ============================================================================

/// Lazily convert every span in a trace export request.
pub fn span_records(
    request: &ExportTraceServiceRequest,
) -> impl Iterator<Item = Result<SpanRecord, ConvertError>> + '_ {
    request.resource_spans.iter().flat_map(|rs| {
        let resource = ResourceContext::new(rs.resource.as_ref());
        rs.scope_spans.iter().flat_map(move |ss| {
            let resource = Arc::clone(&resource);
            let (scope_name, scope_version) = scope_parts(ss.scope.as_ref());
            ss.spans.iter().map(move |span| {
                convert_span(&resource, scope_name.as_ref(), scope_version.as_ref(), span)
            })
        })
    })
}

fn convert_span(
    resource: &ResourceContext,
    scope_name: Option<&String>,
    scope_version: Option<&String>,
    span: &Span,
) -> Result<SpanRecord, ConvertError> {
    let trace_id = required_trace_id(&span.trace_id, "trace_id")?;
    let span_id = required_span_id(&span.span_id, "span_id")?;
    let parent_span_id = optional_span_id(&span.parent_span_id, "parent_span_id")?;

    let status = span
        .status
        .as_ref()
        .map(|s| SpanStatus {
            code: s.code.into(),
            message: s.message.clone(),
        })
        .unwrap_or_default();

    let events = span
        .events
        .iter()
        .map(|e| SpanEvent {
            name: e.name.clone(),
            time_unix_nano: e.time_unix_nano,
            attributes: attributes_to_json(&e.attributes),
        })
        .collect();

    let links = span
        .links
        .iter()
        .filter_map(|l| {
            Some(SpanLink {
                trace_id: TraceId::from_bytes(&l.trace_id)?,
                span_id: SpanId::from_bytes(&l.span_id)?,
                attributes: attributes_to_json(&l.attributes),
            })
        })
        .collect();

    Ok(SpanRecord {
        trace_id,
        span_id,
        parent_span_id,
        name: span.name.clone(),
        kind: span.kind.into(),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        status,
        service_name: resource.service_name.clone(),
        scope_name: scope_name.cloned(),
        scope_version: scope_version.cloned(),
        resource: resource.attributes.clone(),
        attributes: resource.merge(&span.attributes),
        events,
        links,
    })
}

/// Convert a trace export request, skipping malformed spans.
pub fn convert_traces(request: &ExportTraceServiceRequest) -> ConversionResult<SpanRecord> {
    collect(Signal::Traces, span_records(request))
}

/// Number of spans in a request, before conversion.
pub fn span_count(request: &ExportTraceServiceRequest) -> usize {
    request
        .resource_spans
        .iter()
        .flat_map(|rs| &rs.scope_spans)
        .map(|ss| ss.spans.len())
        .sum()
}

// ============================================================================
// Metrics
// ============================================================================

/// Per-metric context shared by that metric's data points.
#[derive(Clone)]
struct MetricContext<'a> {
    resource: Arc<ResourceContext>,
    scope_name: Option<String>,
    metric: &'a Metric,
}

impl MetricContext<'_> {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        kind: MetricKind,
        is_monotonic: Option<bool>,
        start_time_unix_nano: u64,
        time_unix_nano: u64,
        value: MetricValue,
        attributes: &[KeyValue],
        exemplars: &[Exemplar],
    ) -> MetricRecord {
        let exemplar = exemplars
            .iter()
            .find_map(|e| TraceId::from_bytes(&e.trace_id).map(|t| (t, SpanId::from_bytes(&e.span_id))));
        MetricRecord {
            name: self.metric.name.clone(),
            description: self.metric.description.clone(),
            unit: self.metric.unit.clone(),
            kind,
            is_monotonic,
            start_time_unix_nano,
            time_unix_nano,
            value,
            exemplar_trace_id: exemplar.map(|(t, _)| t),
            exemplar_span_id: exemplar.and_then(|(_, s)| s),
            service_name: self.resource.service_name.clone(),
            scope_name: self.scope_name.clone(),
            resource: self.resource.attributes.clone(),
            attributes: self.resource.merge(attributes),
        }
    }

    fn number(
        &self,
        kind: MetricKind,
        is_monotonic: Option<bool>,
        point: &NumberDataPoint,
    ) -> Result<MetricRecord, ConvertError> {
        #[allow(clippy::cast_precision_loss)]
        let value = match point.value {
            Some(number_data_point::Value::AsDouble(v)) => v,
            Some(number_data_point::Value::AsInt(v)) => v as f64,
            None => {
                return Err(ConvertError::MissingValue {
                    name: self.metric.name.clone(),
                })
            }
        };
        Ok(self.record(
            kind,
            is_monotonic,
            point.start_time_unix_nano,
            point.time_unix_nano,
            MetricValue::Number { value },
            &point.attributes,
            &point.exemplars,
        ))
    }

    fn histogram(&self, point: &HistogramDataPoint) -> MetricRecord {
        self.record(
            MetricKind::Histogram,
            None,
            point.start_time_unix_nano,
            point.time_unix_nano,
            MetricValue::Histogram {
                count: point.count,
                sum: point.sum,
                min: point.min,
                max: point.max,
                explicit_bounds: point.explicit_bounds.clone(),
                bucket_counts: point.bucket_counts.clone(),
            },
            &point.attributes,
            &point.exemplars,
        )
    }

    fn exponential_histogram(&self, point: &ExponentialHistogramDataPoint) -> MetricRecord {
        self.record(
            MetricKind::ExponentialHistogram,
            None,
            point.start_time_unix_nano,
            point.time_unix_nano,
            MetricValue::ExponentialHistogram {
                count: point.count,
                sum: point.sum,
                min: point.min,
                max: point.max,
                scale: point.scale,
                zero_count: point.zero_count,
            },
            &point.attributes,
            &point.exemplars,
        )
    }

    fn summary(&self, point: &SummaryDataPoint) -> MetricRecord {
        self.record(
            MetricKind::Summary,
            None,
            point.start_time_unix_nano,
            point.time_unix_nano,
            MetricValue::Summary {
                count: point.count,
                sum: point.sum,
                quantiles: point
                    .quantile_values
                    .iter()
                    .map(|q| QuantileValue {
                        quantile: q.quantile,
                        value: q.value,
                    })
                    .collect(),
            },
            &point.attributes,
            &[],
        )
    }
}

type MetricIter<'a> = Box<dyn Iterator<Item = Result<MetricRecord, ConvertError>> + 'a>;

fn metric_points(ctx: MetricContext<'_>) -> MetricIter<'_> {
    let metric = ctx.metric;
    match &metric.data {
        None => Box::new(std::iter::once(Err(ConvertError::MissingMetricData {
            name: metric.name.clone(),
        }))),
        Some(Data::Gauge(g)) => Box::new(
            g.data_points
                .iter()
                .map(move |p| ctx.number(MetricKind::Gauge, None, p)),
        ),
        Some(Data::Sum(s)) => {
            let monotonic = Some(s.is_monotonic);
            Box::new(
                s.data_points
                    .iter()
                    .map(move |p| ctx.number(MetricKind::Sum, monotonic, p)),
            )
        }
        Some(Data::Histogram(h)) => Box::new(h.data_points.iter().map(move |p| Ok(ctx.histogram(p)))),
        Some(Data::ExponentialHistogram(h)) => Box::new(
            h.data_points
                .iter()
                .map(move |p| Ok(ctx.exponential_histogram(p))),
        ),
        Some(Data::Summary(s)) => Box::new(s.data_points.iter().map(move |p| Ok(ctx.summary(p)))),
    }
}

/// Lazily convert every metric data point in a metrics export request.
pub fn metric_records(
    request: &ExportMetricsServiceRequest,
) -> impl Iterator<Item = Result<MetricRecord, ConvertError>> + '_ {
    request.resource_metrics.iter().flat_map(|rm| {
        let resource = ResourceContext::new(rm.resource.as_ref());
        rm.scope_metrics.iter().flat_map(move |sm| {
            let resource = Arc::clone(&resource);
            let (scope_name, _) = scope_parts(sm.scope.as_ref());
            sm.metrics.iter().flat_map(move |metric| {
                metric_points(MetricContext {
                    resource: Arc::clone(&resource),
                    scope_name: scope_name.clone(),
                    metric,
                })
            })
        })
    })
}

/// Convert a metrics export request, skipping malformed data points.
pub fn convert_metrics(request: &ExportMetricsServiceRequest) -> ConversionResult<MetricRecord> {
    collect(Signal::Metrics, metric_records(request))
}

/// Number of data points in a request, counting an empty metric as one.
pub fn data_point_count(request: &ExportMetricsServiceRequest) -> usize {
    request
        .resource_metrics
        .iter()
        .flat_map(|rm| &rm.scope_metrics)
        .flat_map(|sm| &sm.metrics)
        .map(|m| match &m.data {
            None => 1,
            Some(Data::Gauge(g)) => g.data_points.len(),
            Some(Data::Sum(s)) => s.data_points.len(),
            Some(Data::Histogram(h)) => h.data_points.len(),
            Some(Data::ExponentialHistogram(h)) => h.data_points.len(),
            Some(Data::Summary(s)) => s.data_points.len(),
        })
        .sum()
}

// ============================================================================
// Logs
// ============================================================================

/// Lazily convert every log record in a logs export request.
pub fn log_records(
    request: &ExportLogsServiceRequest,
) -> impl Iterator<Item = Result<LogRecord, ConvertError>> + '_ {
    request.resource_logs.iter().flat_map(|rl| {
        let resource = ResourceContext::new(rl.resource.as_ref());
        rl.scope_logs.iter().flat_map(move |sl| {
            let resource = Arc::clone(&resource);
            let (scope_name, _) = scope_parts(sl.scope.as_ref());
            sl.log_records
                .iter()
                .map(move |log| convert_log(&resource, scope_name.as_ref(), log))
        })
    })
}

fn convert_log(
    resource: &ResourceContext,
    scope_name: Option<&String>,
    log: &OtlpLogRecord,
) -> Result<LogRecord, ConvertError> {
    Ok(LogRecord {
        time_unix_nano: log.time_unix_nano,
        observed_time_unix_nano: log.observed_time_unix_nano,
        severity_number: log.severity_number,
        severity_text: log.severity_text.clone(),
        body: log
            .body
            .as_ref()
            .map_or(serde_json::Value::Null, any_value_to_json),
        trace_id: optional_trace_id(&log.trace_id, "trace_id")?,
        span_id: optional_span_id(&log.span_id, "span_id")?,
        service_name: resource.service_name.clone(),
        scope_name: scope_name.cloned(),
        resource: resource.attributes.clone(),
        attributes: resource.merge(&log.attributes),
    })
}

/// Convert a logs export request, skipping malformed log records.
pub fn convert_logs(request: &ExportLogsServiceRequest) -> ConversionResult<LogRecord> {
    collect(Signal::Logs, log_records(request))
}

/// Number of log records in a request, before conversion.
pub fn log_record_count(request: &ExportLogsServiceRequest) -> usize {
    request
        .resource_logs
        .iter()
        .flat_map(|rl| &rl.scope_logs)
        .map(|sl| sl.log_records.len())
        .sum()
}

// ============================================================================
// Helpers
// ============================================================================

/// Drain a conversion iterator, logging and counting rejected items.
fn collect<T>(
    signal: Signal,
    items: impl Iterator<Item = Result<T, ConvertError>>,
) -> ConversionResult<T> {
    let mut records = Vec::new();
    let mut rejected: i64 = 0;
    let mut first_error: Option<ConvertError> = None;

    for item in items {
        match item {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(signal = %signal, error = %e, "Skipping malformed record");
                rejected += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        None => ConversionResult::success(records),
        Some(e) => {
            tracing::warn!(
                signal = %signal,
                accepted = records.len(),
                rejected,
                "Rejected malformed records in batch"
            );
            ConversionResult::partial(records, rejected, format!("{rejected} rejected: {e}"))
        }
    }
}

fn required_trace_id(bytes: &[u8], field: &'static str) -> Result<TraceId, ConvertError> {
    TraceId::from_bytes(bytes).ok_or(ConvertError::InvalidId {
        field,
        len: bytes.len(),
    })
}

fn required_span_id(bytes: &[u8], field: &'static str) -> Result<SpanId, ConvertError> {
    SpanId::from_bytes(bytes).ok_or(ConvertError::InvalidId {
        field,
        len: bytes.len(),
    })
}

/// Empty or all-zero ids mean "absent"; any other wrong width is malformed.
fn optional_trace_id(bytes: &[u8], field: &'static str) -> Result<Option<TraceId>, ConvertError> {
    if bytes.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    required_trace_id(bytes, field).map(Some)
}

fn optional_span_id(bytes: &[u8], field: &'static str) -> Result<Option<SpanId>, ConvertError> {
    if bytes.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    required_span_id(bytes, field).map(Some)
}

/// Convert OTLP attributes into a JSON attribute map.
pub fn attributes_to_json(attrs: &[KeyValue]) -> Attributes {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_json(v)))
        })
        .collect()
}

/// Convert AnyValue to serde_json::Value.
pub fn any_value_to_json(value: &AnyValue) -> serde_json::Value {
    match &value.value {
        Some(AnyValueKind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(AnyValueKind::IntValue(i)) => serde_json::json!(*i),
        Some(AnyValueKind::DoubleValue(d)) => serde_json::json!(*d),
        Some(AnyValueKind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(AnyValueKind::ArrayValue(arr)) => {
            serde_json::Value::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(AnyValueKind::KvlistValue(kvlist)) => {
            let map: serde_json::Map<String, serde_json::Value> = kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (kv.key.clone(), any_value_to_json(v)))
                })
                .collect();
            serde_json::Value::Object(map)
        }
        Some(AnyValueKind::BytesValue(b)) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        None => serde_json::Value::Null,
    }
}
