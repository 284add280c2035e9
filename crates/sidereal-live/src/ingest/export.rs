//! Transport-independent OTLP export handling.
//!
//! Both receivers funnel requests through these functions: enforce the
//! per-request record limit, convert, hand the records to the live hub, and
//! build the OTLP `partial_success` payload from the rejected count.

use opentelemetry_proto::tonic::collector::{
    logs::v1::{ExportLogsPartialSuccess, ExportLogsServiceRequest},
    metrics::v1::{ExportMetricsPartialSuccess, ExportMetricsServiceRequest},
    trace::v1::{ExportTracePartialSuccess, ExportTraceServiceRequest},
};

use super::convert::{
    convert_logs, convert_metrics, convert_traces, data_point_count, log_record_count, span_count,
    ConversionResult,
};
use crate::pipeline::LiveTelemetry;
use crate::LiveError;

/// Trait for building partial_success responses from ConversionResult.
pub trait PartialSuccessBuilder: Default {
    fn with_rejected_count(count: i64) -> Self;
    fn with_error_message(self, message: String) -> Self;
}

impl PartialSuccessBuilder for ExportTracePartialSuccess {
    fn with_rejected_count(count: i64) -> Self {
        Self {
            rejected_spans: count,
            error_message: String::new(),
        }
    }
    fn with_error_message(mut self, message: String) -> Self {
        self.error_message = message;
        self
    }
}

impl PartialSuccessBuilder for ExportMetricsPartialSuccess {
    fn with_rejected_count(count: i64) -> Self {
        Self {
            rejected_data_points: count,
            error_message: String::new(),
        }
    }
    fn with_error_message(mut self, message: String) -> Self {
        self.error_message = message;
        self
    }
}

impl PartialSuccessBuilder for ExportLogsPartialSuccess {
    fn with_rejected_count(count: i64) -> Self {
        Self {
            rejected_log_records: count,
            error_message: String::new(),
        }
    }
    fn with_error_message(mut self, message: String) -> Self {
        self.error_message = message;
        self
    }
}

/// Build a partial_success response from a ConversionResult.
///
/// Returns None if nothing was rejected; OTLP only expects the field when
/// there is something to report.
pub fn build_partial_success<T, R>(result: &ConversionResult<R>) -> Option<T>
where
    T: PartialSuccessBuilder,
{
    if result.rejected_count == 0 && result.error_message.is_none() {
        return None;
    }

    let partial = T::with_rejected_count(result.rejected_count);
    Some(match &result.error_message {
        Some(msg) => partial.with_error_message(msg.clone()),
        None => partial,
    })
}

fn check_request_size(records: usize, limit: usize) -> Result<(), LiveError> {
    if records > limit {
        return Err(LiveError::RequestTooLarge { records, limit });
    }
    Ok(())
}

/// Ingest a trace export request.
pub fn export_traces(
    live: &LiveTelemetry,
    request: &ExportTraceServiceRequest,
    max_records: usize,
) -> Result<Option<ExportTracePartialSuccess>, LiveError> {
    check_request_size(span_count(request), max_records)?;

    let result = convert_traces(request);
    let partial_success = build_partial_success(&result);
    live.ingest_spans(result.records);
    Ok(partial_success)
}

/// Ingest a metrics export request.
pub fn export_metrics(
    live: &LiveTelemetry,
    request: &ExportMetricsServiceRequest,
    max_records: usize,
) -> Result<Option<ExportMetricsPartialSuccess>, LiveError> {
    check_request_size(data_point_count(request), max_records)?;

    let result = convert_metrics(request);
    let partial_success = build_partial_success(&result);
    live.ingest_metrics(result.records);
    Ok(partial_success)
}

/// Ingest a logs export request.
pub fn export_logs(
    live: &LiveTelemetry,
    request: &ExportLogsServiceRequest,
    max_records: usize,
) -> Result<Option<ExportLogsPartialSuccess>, LiveError> {
    check_request_size(log_record_count(request), max_records)?;

    let result = convert_logs(request);
    let partial_success = build_partial_success(&result);
    live.ingest_logs(result.records);
    Ok(partial_success)
}
