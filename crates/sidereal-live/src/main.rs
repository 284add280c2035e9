//! Sidereal Live binary entry point.
//!
//! Starts the live telemetry service with:
//! - OTLP gRPC receiver (port 4317)
//! - OTLP HTTP receiver (port 4318)
//! - Query, live stream and console API (port 5100)

use std::sync::Arc;

use sidereal_live::{
    api::{api_router, ApiState},
    ingest::{
        otlp_http_router_with_limit, LogsServiceServer, MetricsServiceServer, OtlpGrpcReceiver,
        OtlpHttpState, TraceServiceServer,
    },
    maintenance::start_maintenance,
    LiveConfig, LiveTelemetry,
};
use tokio::signal;
use tokio::sync::watch;
use tonic::transport::Server as TonicServer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sidereal_live=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting sidereal-live");

    let config = LiveConfig::load()?;
    tracing::info!(
        grpc_addr = %config.server.grpc_addr,
        http_addr = %config.server.http_addr,
        api_addr = %config.server.api_addr,
        span_capacity = config.store.span_capacity,
        max_sessions = config.sessions.max_sessions,
        "Configuration loaded"
    );

    let grpc_addr = config.server.grpc_addr;
    let http_addr = config.server.http_addr;
    let api_addr = config.server.api_addr;
    let max_body_bytes = config.ingest.max_body_bytes;
    let max_records = config.ingest.max_records_per_request;
    let maintenance_interval = config.maintenance.interval();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = stop_tx.send(true);
    });

    let live = Arc::new(LiveTelemetry::new(config));
    let maintenance = start_maintenance(Arc::clone(&live), maintenance_interval);

    let grpc_receiver = OtlpGrpcReceiver::new(Arc::clone(&live), max_records);
    let grpc_server = TonicServer::builder()
        .add_service(
            TraceServiceServer::new(grpc_receiver.clone()).max_decoding_message_size(max_body_bytes),
        )
        .add_service(
            MetricsServiceServer::new(grpc_receiver.clone())
                .max_decoding_message_size(max_body_bytes),
        )
        .add_service(LogsServiceServer::new(grpc_receiver).max_decoding_message_size(max_body_bytes))
        .serve_with_shutdown(grpc_addr, stopped(stop_rx.clone()));

    let http_state = OtlpHttpState {
        live: Arc::clone(&live),
        max_records_per_request: max_records,
    };
    let http_router = otlp_http_router_with_limit(http_state, max_body_bytes);
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(stopped(stop_rx.clone()));

    let api = api_router(ApiState::new(live)).layer(TraceLayer::new_for_http());
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let api_server =
        axum::serve(api_listener, api).with_graceful_shutdown(stopped(stop_rx));

    tracing::info!(
        grpc = %grpc_addr,
        http = %http_addr,
        api = %api_addr,
        "Servers starting"
    );

    tokio::select! {
        result = grpc_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gRPC server error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP OTLP server error");
            }
        }
        result = api_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Live API server error");
            }
        }
    }

    tracing::info!("Shutting down background tasks");
    maintenance.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves once the stop flag flips, or the sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, Ctrl+C only");
                if signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl+C received, stopping");
                }
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => tracing::info!("Ctrl+C received, stopping"),
            _ = term.recv() => tracing::info!("SIGTERM received, stopping"),
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    } else {
        tracing::info!("Ctrl+C received, stopping");
    }
}
