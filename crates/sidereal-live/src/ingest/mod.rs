//! OTLP ingestion receivers.
//!
//! This module provides gRPC and HTTP receivers for OTLP telemetry data and
//! the conversion from OTLP messages to live records.

pub mod convert;
pub mod export;
pub mod grpc;
pub mod http;

pub use convert::{convert_logs, convert_metrics, convert_traces, ConversionResult, ConvertError};
pub use export::{export_logs, export_metrics, export_traces};
pub use grpc::{LogsServiceServer, MetricsServiceServer, OtlpGrpcReceiver, TraceServiceServer};
pub use http::{otlp_http_router, otlp_http_router_with_limit, OtlpHttpState};
