//! The live telemetry hub.
//!
//! [`LiveTelemetry`] owns one store per record kind, both aggregators, the
//! event broadcaster and the console bridge. Converted batches flow through
//! it in a fixed order: store insert, aggregator updates, then publish.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::{LiveConfig, TraceConfig};
use crate::console::FrontendConsole;
use crate::model::{LogRecord, MetricRecord, Signal, SpanRecord};
use crate::sessions::{
    correlation_key, explicit_session_id, SessionAggregator, SessionId, SessionStatistics,
    SessionStatus,
};
use crate::store::TelemetryStore;
use crate::traces::{SpanAdmission, TraceAggregator};

/// An event pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Spans(Vec<Arc<SpanRecord>>),
    Metrics(Vec<Arc<MetricRecord>>),
    Logs(Vec<Arc<LogRecord>>),
    Session(Arc<SessionStatus>),
}

impl TelemetryEvent {
    /// Name used for the SSE `event:` field.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Spans(_) => "spans",
            Self::Metrics(_) => "metrics",
            Self::Logs(_) => "logs",
            Self::Session(_) => "session",
        }
    }

    /// Signal carried by the event; session updates belong to traces.
    pub const fn signal(&self) -> Signal {
        match self {
            Self::Spans(_) | Self::Session(_) => Signal::Traces,
            Self::Metrics(_) => Signal::Metrics,
            Self::Logs(_) => Signal::Logs,
        }
    }

    /// Narrow the event to what belongs to `session_id`.
    ///
    /// Returns `None` when nothing in the event belongs to the session.
    /// Metric points carry no session and are always filtered out.
    pub fn for_session(&self, session_id: &str) -> Option<Self> {
        let event = match self {
            Self::Spans(spans) => Self::Spans(
                spans
                    .iter()
                    .filter(|s| correlation_key(s) == session_id)
                    .cloned()
                    .collect(),
            ),
            Self::Logs(logs) => Self::Logs(
                logs.iter()
                    .filter(|log| {
                        explicit_session_id(&log.attributes).map_or_else(
                            || log.trace_id.is_some_and(|t| t.to_hex() == session_id),
                            |id| id == session_id,
                        )
                    })
                    .cloned()
                    .collect(),
            ),
            Self::Session(status) if status.session_id == session_id => {
                Self::Session(Arc::clone(status))
            }
            Self::Metrics(_) | Self::Session(_) => return None,
        };
        (!event.is_empty()).then_some(event)
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Spans(v) => v.is_empty(),
            Self::Metrics(v) => v.is_empty(),
            Self::Logs(v) => v.is_empty(),
            Self::Session(_) => false,
        }
    }
}

/// Size and eviction counters for one store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub len: usize,
    pub capacity: usize,
    pub last_sequence: u64,
    pub evicted_total: u64,
}

impl StoreStats {
    fn of<T>(store: &TelemetryStore<T>) -> Self {
        Self {
            len: store.len(),
            capacity: store.capacity(),
            last_sequence: store.last_sequence(),
            evicted_total: store.evicted_total(),
        }
    }
}

/// Snapshot served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStats {
    pub spans: StoreStats,
    pub metrics: StoreStats,
    pub logs: StoreStats,
    pub traces: usize,
    /// Spans already held by their trace, typically exporter retries.
    pub duplicate_spans: u64,
    /// Spans refused because their trace was full.
    pub trace_spans_dropped: u64,
    pub sessions: SessionStatistics,
    pub subscribers: usize,
    pub dropped_events: u64,
    pub console_entries: usize,
}

/// What one maintenance pass removed or closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub spans_pruned: usize,
    pub metrics_pruned: usize,
    pub logs_pruned: usize,
    pub traces_pruned: usize,
    pub sessions_closed: usize,
    pub sessions_pruned: usize,
}

impl MaintenanceReport {
    pub const fn is_empty(&self) -> bool {
        self.spans_pruned == 0
            && self.metrics_pruned == 0
            && self.logs_pruned == 0
            && self.traces_pruned == 0
            && self.sessions_closed == 0
            && self.sessions_pruned == 0
    }
}

/// Owns the in-memory live telemetry state.
#[derive(Debug)]
pub struct LiveTelemetry {
    config: LiveConfig,
    spans: TelemetryStore<SpanRecord>,
    metrics: TelemetryStore<MetricRecord>,
    logs: TelemetryStore<LogRecord>,
    traces: TraceAggregator,
    sessions: SessionAggregator,
    events: Broadcaster<TelemetryEvent>,
    console: FrontendConsole,
    duplicate_spans: AtomicU64,
    trace_spans_dropped: AtomicU64,
}

impl LiveTelemetry {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            spans: TelemetryStore::new("spans", config.store.span_capacity),
            metrics: TelemetryStore::new("metrics", config.store.metric_capacity),
            logs: TelemetryStore::new("logs", config.store.log_capacity),
            traces: TraceAggregator::new(&TraceConfig {
                // A trace never holds more spans than the store retains.
                max_spans_per_trace: config
                    .traces
                    .max_spans_per_trace
                    .min(config.store.span_capacity),
                ..config.traces.clone()
            }),
            sessions: SessionAggregator::new(&config.sessions),
            events: Broadcaster::new("live", config.broadcast.subscriber_queue),
            console: FrontendConsole::new(&config.console),
            duplicate_spans: AtomicU64::new(0),
            trace_spans_dropped: AtomicU64::new(0),
            config,
        }
    }

    pub const fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub const fn spans(&self) -> &TelemetryStore<SpanRecord> {
        &self.spans
    }

    pub const fn metrics(&self) -> &TelemetryStore<MetricRecord> {
        &self.metrics
    }

    pub const fn logs(&self) -> &TelemetryStore<LogRecord> {
        &self.logs
    }

    pub const fn traces(&self) -> &TraceAggregator {
        &self.traces
    }

    pub const fn sessions(&self) -> &SessionAggregator {
        &self.sessions
    }

    pub const fn console(&self) -> &FrontendConsole {
        &self.console
    }

    /// Subscribe to live telemetry events.
    pub fn subscribe(&self) -> Subscription<TelemetryEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Store spans, fold them into traces and sessions, and publish.
    ///
    /// Every span lands in the store. Only spans the trace aggregator admits
    /// reach the session rollups and live subscribers, so a retried export
    /// is not counted twice.
    ///
    /// Returns the number of spans stored.
    pub fn ingest_spans(&self, records: Vec<SpanRecord>) -> usize {
        let entries = self.spans.insert_batch(records);
        if entries.is_empty() {
            return 0;
        }
        let count = entries.len();

        let mut admitted: Vec<Arc<SpanRecord>> = Vec::with_capacity(count);
        let mut touched: BTreeSet<SessionId> = BTreeSet::new();
        let (mut duplicates, mut dropped) = (0u64, 0u64);
        for entry in entries {
            match self.traces.add_span(Arc::clone(&entry.record)) {
                SpanAdmission::Added => {
                    touched.insert(self.sessions.attach(&entry.record));
                    admitted.push(entry.record);
                }
                SpanAdmission::Duplicate => duplicates += 1,
                SpanAdmission::TraceFull => dropped += 1,
            }
        }
        if duplicates > 0 {
            self.duplicate_spans.fetch_add(duplicates, Ordering::Relaxed);
        }
        if dropped > 0 {
            self.trace_spans_dropped.fetch_add(dropped, Ordering::Relaxed);
        }

        tracing::debug!(
            spans = count,
            duplicates,
            dropped,
            sessions = touched.len(),
            "Ingested spans"
        );

        if !admitted.is_empty() && self.events.subscriber_count() > 0 {
            self.events.publish(&TelemetryEvent::Spans(admitted));
            self.publish_sessions(touched);
        }
        count
    }

    pub fn ingest_metrics(&self, records: Vec<MetricRecord>) -> usize {
        let entries = self.metrics.insert_batch(records);
        let count = entries.len();
        if count > 0 {
            tracing::debug!(points = count, "Ingested metric points");
            if self.events.subscriber_count() > 0 {
                let records = entries.into_iter().map(|e| e.record).collect();
                self.events.publish(&TelemetryEvent::Metrics(records));
            }
        }
        count
    }

    pub fn ingest_logs(&self, records: Vec<LogRecord>) -> usize {
        let entries = self.logs.insert_batch(records);
        let count = entries.len();
        if count > 0 {
            tracing::debug!(logs = count, "Ingested log records");
            if self.events.subscriber_count() > 0 {
                let records = entries.into_iter().map(|e| e.record).collect();
                self.events.publish(&TelemetryEvent::Logs(records));
            }
        }
        count
    }

    fn publish_sessions(&self, session_ids: impl IntoIterator<Item = SessionId>) {
        for id in session_ids {
            if let Some(status) = self.sessions.get_status(&id) {
                self.events
                    .publish(&TelemetryEvent::Session(Arc::new(status)));
            }
        }
    }

    /// Age out stored records, expire traces, and close or drop idle sessions.
    pub fn maintain(&self) -> MaintenanceReport {
        let max_age = self.config.store.max_age();
        let closed = self.sessions.sweep(self.config.sessions.idle_timeout());

        let report = MaintenanceReport {
            spans_pruned: self.spans.prune_older_than(max_age),
            metrics_pruned: self.metrics.prune_older_than(max_age),
            logs_pruned: self.logs.prune_older_than(max_age),
            traces_pruned: self.traces.prune(self.config.traces.retention()),
            sessions_closed: closed.len(),
            sessions_pruned: self.sessions.prune(self.config.sessions.retention()),
        };

        if self.events.subscriber_count() > 0 {
            self.publish_sessions(closed);
        }
        if !report.is_empty() {
            tracing::debug!(?report, "Maintenance pass complete");
        }
        report
    }

    pub fn stats(&self) -> LiveStats {
        LiveStats {
            spans: StoreStats::of(&self.spans),
            metrics: StoreStats::of(&self.metrics),
            logs: StoreStats::of(&self.logs),
            traces: self.traces.len(),
            duplicate_spans: self.duplicate_spans.load(Ordering::Relaxed),
            trace_spans_dropped: self.trace_spans_dropped.load(Ordering::Relaxed),
            sessions: self.sessions.statistics(),
            subscribers: self.events.subscriber_count(),
            dropped_events: self.events.dropped_total(),
            console_entries: self.console.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::RunStatus;
    use crate::test_fixtures::{log, metric, span, span_with_attrs, test_live};
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    #[rstest]
    #[tokio::test]
    async fn span_batch_flows_through_every_stage(test_live: Arc<LiveTelemetry>) {
        let live = test_live;
        let mut sub = live.subscribe();

        let stored = live.ingest_spans(vec![span(1, 1, None, 100), span(1, 2, Some(1), 200)]);
        assert_eq!(stored, 2);
        assert_eq!(live.spans().len(), 2);
        assert_eq!(live.traces().len(), 1);
        assert_eq!(live.sessions().len(), 1);

        let TelemetryEvent::Spans(spans) = sub.recv().await.unwrap() else {
            panic!("expected spans event first");
        };
        assert_eq!(spans.len(), 2);

        let TelemetryEvent::Session(status) = sub.recv().await.unwrap() else {
            panic!("expected session update");
        };
        assert_eq!(status.span_count, 2);
        assert_eq!(status.status, RunStatus::Running);
    }

    #[rstest]
    fn empty_batches_publish_nothing(test_live: Arc<LiveTelemetry>) {
        let live = test_live;
        let mut sub = live.subscribe();
        assert_eq!(live.ingest_spans(Vec::new()), 0);
        assert_eq!(live.ingest_metrics(Vec::new()), 0);
        assert_eq!(live.ingest_logs(Vec::new()), 0);
        assert!(sub.try_recv().is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn metrics_and_logs_are_stored_and_published(test_live: Arc<LiveTelemetry>) {
        let live = test_live;
        let mut sub = live.subscribe();

        live.ingest_metrics(vec![metric("requests", 1.0)]);
        live.ingest_logs(vec![log("hello", None)]);

        assert_eq!(live.metrics().len(), 1);
        assert_eq!(live.logs().len(), 1);
        assert_eq!(sub.recv().await.unwrap().event_name(), "metrics");
        assert_eq!(sub.recv().await.unwrap().event_name(), "logs");
    }

    #[test]
    fn session_filter_keeps_only_matching_items() {
        let a = Arc::new(span_with_attrs(1, 1, &[("session.id", json!("a"))]));
        let b = Arc::new(span_with_attrs(2, 1, &[("session.id", json!("b"))]));
        let event = TelemetryEvent::Spans(vec![a, b]);

        let Some(TelemetryEvent::Spans(only_a)) = event.for_session("a") else {
            panic!("expected filtered spans");
        };
        assert_eq!(only_a.len(), 1);
        assert!(event.for_session("c").is_none());

        let trace_hex = crate::model::TraceId::from([9; 16]).to_hex();
        let logs = TelemetryEvent::Logs(vec![Arc::new(log("x", Some(9)))]);
        assert!(logs.for_session(&trace_hex).is_some());
        assert!(TelemetryEvent::Metrics(vec![Arc::new(metric("m", 1.0))])
            .for_session("a")
            .is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn retried_spans_are_not_double_counted(test_live: Arc<LiveTelemetry>) {
        let live = test_live;
        let retried = || {
            let mut s = span_with_attrs(
                1,
                1,
                &[
                    ("session.id", json!("run-1")),
                    ("gen_ai.usage.input_tokens", json!(10)),
                ],
            );
            s.status.code = crate::model::StatusCode::Error;
            s
        };

        live.ingest_spans(vec![retried()]);
        let mut sub = live.subscribe();
        assert_eq!(live.ingest_spans(vec![retried()]), 1);

        let trace = live.traces().get_summary(&crate::model::TraceId::from([1; 16])).unwrap();
        let session = live.sessions().get_status("run-1").unwrap();
        assert_eq!(trace.span_count, 1);
        assert_eq!(session.span_count, 1);
        assert_eq!(session.total_tokens, 10);
        assert_eq!(session.error_count, 1);
        assert_eq!(live.spans().len(), 2);
        assert_eq!(live.stats().duplicate_spans, 1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn deep_chain_in_one_batch_is_capped_and_serializable() {
        let live = LiveTelemetry::new(LiveConfig::default());
        let depth = 100_000u64;
        let chain: Vec<SpanRecord> = (0..depth)
            .map(|i| {
                let mut s = span(1, 0, None, i);
                s.span_id = crate::model::SpanId::from((i + 1).to_be_bytes());
                s.parent_span_id =
                    (i > 0).then(|| crate::model::SpanId::from(i.to_be_bytes()));
                s
            })
            .collect();
        live.ingest_spans(chain);

        let cap = live.config().traces.max_spans_per_trace;
        let stats = live.stats();
        assert_eq!(stats.trace_spans_dropped, depth - cap as u64);
        assert_eq!(stats.sessions.total_spans, cap as u64);

        let tree = live
            .traces()
            .get_trace_tree(&crate::model::TraceId::from([1; 16]))
            .unwrap();
        assert_eq!(tree.node_count(), cap);
        assert!(tree.depth() <= crate::traces::MAX_TREE_DEPTH);
        assert!(serde_json::to_string(&tree).is_ok());
    }

    #[tokio::test]
    async fn busy_trace_is_bounded_by_span_capacity() {
        let mut config = LiveConfig::default();
        config.store.span_capacity = 100;
        let live = LiveTelemetry::new(config);

        for id in 0..5_000u64 {
            let mut s = span(7, 0, None, id);
            s.span_id = crate::model::SpanId::from((id + 1).to_be_bytes());
            live.ingest_spans(vec![s]);
        }

        let summary = live
            .traces()
            .get_summary(&crate::model::TraceId::from([7; 16]))
            .unwrap();
        assert_eq!(live.spans().len(), 100);
        assert_eq!(summary.span_count, 100);
        assert_eq!(summary.dropped_spans, 4_900);
        assert_eq!(live.stats().trace_spans_dropped, 4_900);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_closes_and_prunes() {
        let mut config = LiveConfig::default();
        config.sessions.idle_timeout_secs = 10;
        config.sessions.retention_secs = 100;
        config.store.max_age_secs = 50;
        config.traces.retention_secs = 50;
        let live = LiveTelemetry::new(config);
        live.ingest_spans(vec![span(1, 1, None, 100)]);

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = live.maintain();
        assert_eq!(report.sessions_closed, 1);
        assert_eq!(report.spans_pruned, 0);

        tokio::time::advance(Duration::from_secs(40)).await;
        let report = live.maintain();
        assert_eq!(report.spans_pruned, 1);
        assert_eq!(report.traces_pruned, 1);
        assert_eq!(report.sessions_pruned, 0);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(live.maintain().sessions_pruned, 1);
        assert!(live.maintain().is_empty());
    }

    #[test]
    fn stats_reflect_store_counters() {
        let mut config = LiveConfig::default();
        config.store.span_capacity = 2;
        let live = LiveTelemetry::new(config);
        live.ingest_spans(vec![span(1, 1, None, 1), span(1, 2, None, 2), span(1, 3, None, 3)]);

        let stats = live.stats();
        assert_eq!(stats.spans.len, 2);
        assert_eq!(stats.spans.capacity, 2);
        assert_eq!(stats.spans.last_sequence, 3);
        assert_eq!(stats.spans.evicted_total, 1);
        assert_eq!(stats.sessions.total_spans, 3);
    }
}
