//! Configuration types for the live telemetry service.

use std::net::SocketAddr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::LiveError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default OTLP gRPC port (OpenTelemetry standard).
pub const DEFAULT_GRPC_PORT: u16 = 4317;

/// Default OTLP HTTP port (OpenTelemetry standard).
pub const DEFAULT_HTTP_PORT: u16 = 4318;

/// Default query, streaming and console API port.
pub const DEFAULT_API_PORT: u16 = 5100;

/// Default maximum request body size (16 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Default maximum records per ingestion request.
///
/// Requests exceeding this limit receive a 413 Payload Too Large response.
pub const DEFAULT_MAX_RECORDS_PER_REQUEST: usize = 100_000;

/// Default number of spans retained in memory.
pub const DEFAULT_SPAN_CAPACITY: usize = 10_000;

/// Default number of metric data points retained in memory.
pub const DEFAULT_METRIC_CAPACITY: usize = 10_000;

/// Default number of log records retained in memory.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Default maximum age of a stored record, in seconds (1 hour).
pub const DEFAULT_STORE_MAX_AGE_SECS: u64 = 3600;

/// Default number of traces tracked by the trace aggregator.
pub const DEFAULT_MAX_TRACES: usize = 1000;

/// Default number of spans a single trace may hold.
pub const DEFAULT_MAX_SPANS_PER_TRACE: usize = 10_000;

/// Default idle grace period for a trace, in seconds.
pub const DEFAULT_TRACE_GRACE_PERIOD_SECS: u64 = 30;

/// Default trace retention, in seconds (5 minutes).
pub const DEFAULT_TRACE_RETENTION_SECS: u64 = 300;

/// Default number of sessions tracked by the session aggregator.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Default session idle timeout, in seconds (30 minutes).
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Default session retention, in seconds (24 hours).
pub const DEFAULT_SESSION_RETENTION_SECS: u64 = 86_400;

/// Default latency reservoir size per session.
pub const DEFAULT_LATENCY_RESERVOIR: usize = 256;

/// Default number of error details kept per session.
pub const DEFAULT_MAX_SESSION_ERRORS: usize = 50;

/// Default number of span references kept per session.
pub const DEFAULT_MAX_SESSION_SPANS: usize = 10_000;

/// Default per-subscriber queue depth for live telemetry.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1000;

/// Default number of browser console entries retained.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 5000;

/// Default per-subscriber queue depth for the console stream.
pub const DEFAULT_CONSOLE_SUBSCRIBER_QUEUE: usize = 100;

/// Default maintenance sweep interval, in seconds.
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Live telemetry service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Ingestion request limits.
    pub ingest: IngestConfig,
    /// In-memory store bounds.
    pub store: StoreConfig,
    /// Trace aggregation.
    pub traces: TraceConfig,
    /// Session aggregation.
    pub sessions: SessionConfig,
    /// Live broadcast.
    pub broadcast: BroadcastConfig,
    /// Browser console bridge.
    pub console: ConsoleConfig,
    /// Periodic maintenance.
    pub maintenance: MaintenanceConfig,
}

impl LiveConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `live.toml` in current directory
    /// 3. Environment variables prefixed with `LIVE_`, nested with `__`
    ///    (e.g. `LIVE_STORE__SPAN_CAPACITY=5000`)
    pub fn load() -> Result<Self, LiveError> {
        Self::load_from("live.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, LiveError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LIVE_").split("__"))
            .extract()
            .map_err(|e| LiveError::Config(e.to_string()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, LiveError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| LiveError::Config(e.to_string()))
    }
}

/// Server address configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// OTLP gRPC address (default: 0.0.0.0:4317).
    pub grpc_addr: SocketAddr,
    /// OTLP HTTP address (default: 0.0.0.0:4318).
    pub http_addr: SocketAddr,
    /// Query, live stream and console API address (default: 0.0.0.0:5100).
    pub api_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GRPC_PORT)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
        }
    }
}

/// Limits applied to inbound OTLP requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum request body size in bytes, after decompression.
    pub max_body_bytes: usize,
    /// Maximum records per ingestion request.
    pub max_records_per_request: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_records_per_request: DEFAULT_MAX_RECORDS_PER_REQUEST,
        }
    }
}

/// Bounds for the per-signal telemetry stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub span_capacity: usize,
    pub metric_capacity: usize,
    pub log_capacity: usize,
    /// Records older than this are evicted by the maintenance sweep.
    pub max_age_secs: u64,
}

impl StoreConfig {
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            span_capacity: DEFAULT_SPAN_CAPACITY,
            metric_capacity: DEFAULT_METRIC_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_age_secs: DEFAULT_STORE_MAX_AGE_SECS,
        }
    }
}

/// Trace aggregation tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Maximum number of traces tracked at once.
    pub max_traces: usize,
    /// Spans beyond this per trace are dropped and counted.
    pub max_spans_per_trace: usize,
    /// A trace with no new span for this long is reported as idle.
    pub grace_period_secs: u64,
    /// Traces idle for longer than this are pruned.
    pub retention_secs: u64,
}

impl TraceConfig {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_traces: DEFAULT_MAX_TRACES,
            max_spans_per_trace: DEFAULT_MAX_SPANS_PER_TRACE,
            grace_period_secs: DEFAULT_TRACE_GRACE_PERIOD_SECS,
            retention_secs: DEFAULT_TRACE_RETENTION_SECS,
        }
    }
}

/// Session aggregation tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions tracked at once.
    pub max_sessions: usize,
    /// A running session with no new span for this long is closed.
    pub idle_timeout_secs: u64,
    /// Sessions with no activity for this long are pruned.
    pub retention_secs: u64,
    /// Number of span durations sampled for percentile estimates.
    pub latency_reservoir: usize,
    /// Number of error details kept per session.
    pub max_errors: usize,
    /// Span references kept per session; rollups keep counting past it.
    pub max_spans: usize,
}

impl SessionConfig {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
            retention_secs: DEFAULT_SESSION_RETENTION_SECS,
            latency_reservoir: DEFAULT_LATENCY_RESERVOIR,
            max_errors: DEFAULT_MAX_SESSION_ERRORS,
            max_spans: DEFAULT_MAX_SESSION_SPANS,
        }
    }
}

/// Live broadcast configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events queued per subscriber before new events are dropped.
    pub subscriber_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Browser console bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub capacity: usize,
    pub subscriber_queue: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CONSOLE_CAPACITY,
            subscriber_queue: DEFAULT_CONSOLE_SUBSCRIBER_QUEUE,
        }
    }
}

/// Periodic maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

impl MaintenanceConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
        }
    }
}
