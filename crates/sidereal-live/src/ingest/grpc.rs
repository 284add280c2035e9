//! tonic OTLP receiver. One value serves the trace, metrics and logs
//! collector services; mount it three times via the `*ServiceServer` wrappers.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::{
    logs::v1::{
        logs_service_server::LogsService, ExportLogsServiceRequest, ExportLogsServiceResponse,
    },
    metrics::v1::{
        metrics_service_server::MetricsService, ExportMetricsServiceRequest,
        ExportMetricsServiceResponse,
    },
    trace::v1::{
        trace_service_server::TraceService, ExportTraceServiceRequest, ExportTraceServiceResponse,
    },
};
use tonic::{Request, Response, Status};

pub use opentelemetry_proto::tonic::collector::{
    logs::v1::logs_service_server::LogsServiceServer,
    metrics::v1::metrics_service_server::MetricsServiceServer,
    trace::v1::trace_service_server::TraceServiceServer,
};

use super::export::{export_logs, export_metrics, export_traces};
use crate::pipeline::LiveTelemetry;

#[derive(Clone)]
pub struct OtlpGrpcReceiver {
    live: Arc<LiveTelemetry>,
    max_records_per_request: usize,
}

impl OtlpGrpcReceiver {
    pub const fn new(live: Arc<LiveTelemetry>, max_records_per_request: usize) -> Self {
        Self {
            live,
            max_records_per_request,
        }
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcReceiver {
    #[tracing::instrument(skip_all, fields(signal = "traces"))]
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let request = request.into_inner();
        let partial_success = export_traces(&self.live, &request, self.max_records_per_request)?;
        Ok(Response::new(ExportTraceServiceResponse { partial_success }))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpGrpcReceiver {
    #[tracing::instrument(skip_all, fields(signal = "metrics"))]
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let request = request.into_inner();
        let partial_success = export_metrics(&self.live, &request, self.max_records_per_request)?;
        Ok(Response::new(ExportMetricsServiceResponse { partial_success }))
    }
}

#[tonic::async_trait]
impl LogsService for OtlpGrpcReceiver {
    #[tracing::instrument(skip_all, fields(signal = "logs"))]
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let request = request.into_inner();
        let partial_success = export_logs(&self.live, &request, self.max_records_per_request)?;
        Ok(Response::new(ExportLogsServiceResponse { partial_success }))
    }
}
