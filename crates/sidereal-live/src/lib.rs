//! Sidereal Live - in-memory live telemetry core.
//!
//! This crate receives OTLP telemetry and keeps a bounded, queryable view of
//! the most recent data:
//! - Receives standard OTLP (gRPC + HTTP) for traces, metrics, and logs
//! - Holds recent records in bounded per-signal stores
//! - Assembles traces into trees and correlates spans into agent sessions
//! - Fans every accepted batch out to live subscribers over SSE
//! - Bridges browser console output into the same live view
//!
//! ## Architecture
//!
//! ```text
//! OTLP gRPC/HTTP → convert → LiveTelemetry ─┬→ TelemetryStore (spans, metrics, logs)
//!                                           ├→ TraceAggregator
//!                                           ├→ SessionAggregator
//!                                           └→ Broadcaster → SSE subscribers
//!
//! browser console → FrontendConsole → Broadcaster → SSE subscribers
//! ```

pub mod api;
pub mod broadcast;
pub mod config;
pub mod console;
pub mod error;
pub mod ingest;
pub mod maintenance;
pub mod model;
pub mod pipeline;
mod recency;
pub mod sessions;
pub mod store;
pub mod traces;

#[cfg(test)]
pub mod test_fixtures;

pub use config::LiveConfig;
pub use error::LiveError;
pub use model::Signal;
pub use pipeline::LiveTelemetry;
