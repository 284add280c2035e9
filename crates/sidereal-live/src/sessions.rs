//! Session (agent run) aggregation.
//!
//! Spans are grouped into sessions by a correlation attribute, falling back
//! to the trace id when no explicit id is present. Rollups (tokens, cost,
//! tool calls, errors, latency) are updated as each span is attached, so a
//! status query is a snapshot of counters rather than a recomputation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::model::{Attributes, SpanId, SpanRecord, TraceId};
use crate::recency::RecencyIndex;
use crate::LiveError;

/// Session identifier: an explicit run/session id, or the trace id in hex.
pub type SessionId = String;

/// Attribute keys checked, in order, for an explicit session id.
pub const SESSION_ID_KEYS: [&str; 3] = ["session.id", "gen_ai.conversation.id", "agent.run.id"];

/// Attribute keys carrying an explicit terminal status.
const STATUS_KEYS: [&str; 2] = ["agent.run.status", "session.status"];

mod genai {
    pub const INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const PROMPT_TOKENS: &str = "gen_ai.usage.prompt_tokens";
    pub const OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const COMPLETION_TOKENS: &str = "gen_ai.usage.completion_tokens";
    pub const COST: &str = "gen_ai.usage.cost";
    pub const RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const OPERATION_NAME: &str = "gen_ai.operation.name";
    pub const TOOL_NAME: &str = "gen_ai.tool.name";
    pub const EXCEPTION_MESSAGE: &str = "exception.message";
}

/// Derive the session id for a span.
pub fn correlation_key(span: &SpanRecord) -> SessionId {
    explicit_session_id(&span.attributes).map_or_else(|| span.trace_id.to_hex(), str::to_owned)
}

/// The first non-empty explicit session id attribute, if any.
pub fn explicit_session_id(attributes: &Attributes) -> Option<&str> {
    SESSION_ID_KEYS.iter().find_map(|key| {
        attributes
            .get(*key)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
    })
}

/// Run status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Map an explicit status attribute value to a terminal status.
    fn from_signal(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "succeeded" | "success" | "completed" | "ok" => Some(Self::Succeeded),
            "failed" | "failure" | "error" | "cancelled" | "canceled" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl FromStr for RunStatus {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(LiveError::InvalidParameter(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// What moved a session into its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosedBy {
    /// A span carried an explicit terminal status. Sticky.
    Signal,
    /// The idle sweep closed it. Reopened by the next span.
    Idle,
}

/// One recorded error within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionError {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub span_name: String,
    pub message: String,
    pub time_unix_nano: u64,
}

/// Running latency digest over closed span durations.
///
/// Exact min/max/count/sum plus a fixed-size uniform reservoir for
/// percentile estimates.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    count: u64,
    sum_nanos: u128,
    min_nanos: u64,
    max_nanos: u64,
    reservoir: Vec<u64>,
    reservoir_size: usize,
}

impl LatencyDigest {
    pub fn new(reservoir_size: usize) -> Self {
        let reservoir_size = reservoir_size.max(1);
        Self {
            count: 0,
            sum_nanos: 0,
            min_nanos: u64::MAX,
            max_nanos: 0,
            reservoir: Vec::with_capacity(reservoir_size.min(64)),
            reservoir_size,
        }
    }

    pub fn record(&mut self, nanos: u64) {
        self.count = self.count.saturating_add(1);
        self.sum_nanos = self.sum_nanos.saturating_add(u128::from(nanos));
        self.min_nanos = self.min_nanos.min(nanos);
        self.max_nanos = self.max_nanos.max(nanos);

        if self.reservoir.len() < self.reservoir_size {
            self.reservoir.push(nanos);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.count);
            if let Some(existing) = usize::try_from(slot)
                .ok()
                .and_then(|i| self.reservoir.get_mut(i))
            {
                *existing = nanos;
            }
        }
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Nearest-rank percentile over the reservoir, `p` in `0.0..=1.0`.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.reservoir.is_empty() {
            return None;
        }
        let mut sorted = self.reservoir.clone();
        sorted.sort_unstable();
        Some(nearest_rank(&sorted, p))
    }

    pub fn stats(&self) -> LatencyStats {
        if self.count == 0 {
            return LatencyStats::default();
        }
        let mut sorted = self.reservoir.clone();
        sorted.sort_unstable();
        LatencyStats {
            count: self.count,
            min_nanos: self.min_nanos,
            max_nanos: self.max_nanos,
            mean_nanos: u64::try_from(self.sum_nanos / u128::from(self.count)).unwrap_or(u64::MAX),
            p50_nanos: nearest_rank(&sorted, 0.50),
            p90_nanos: nearest_rank(&sorted, 0.90),
            p99_nanos: nearest_rank(&sorted, 0.99),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn nearest_rank(sorted: &[u64], p: f64) -> u64 {
    let n = sorted.len();
    let rank = (p.clamp(0.0, 1.0) * n as f64).ceil() as usize;
    sorted
        .get(rank.saturating_sub(1).min(n.saturating_sub(1)))
        .copied()
        .unwrap_or_default()
}

/// Latency snapshot for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_nanos: u64,
    pub max_nanos: u64,
    pub mean_nanos: u64,
    pub p50_nanos: u64,
    pub p90_nanos: u64,
    pub p99_nanos: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub count: u64,
}

/// Current rollup of a session, without its span list.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub status: RunStatus,
    pub closed_by: Option<ClosedBy>,
    pub services: Vec<String>,
    pub trace_ids: Vec<TraceId>,
    pub span_count: u64,
    pub error_count: u64,
    pub errors: Vec<SessionError>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub tool_calls: u64,
    pub primary_model: Option<String>,
    pub models: Vec<ModelUsage>,
    pub latency: LatencyStats,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
}

#[derive(Debug)]
struct SessionState {
    status: RunStatus,
    closed_by: Option<ClosedBy>,
    services: BTreeSet<String>,
    trace_ids: BTreeSet<TraceId>,
    spans: Vec<Arc<SpanRecord>>,
    span_count: u64,
    error_count: u64,
    errors: VecDeque<SessionError>,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
    tool_calls: u64,
    models: HashMap<String, u64>,
    latency: LatencyDigest,
    start_time_unix_nano: u64,
    end_time_unix_nano: u64,
    last_attach: Instant,
}

impl SessionState {
    fn new(now: Instant, reservoir: usize) -> Self {
        Self {
            status: RunStatus::Running,
            closed_by: None,
            services: BTreeSet::new(),
            trace_ids: BTreeSet::new(),
            spans: Vec::new(),
            span_count: 0,
            error_count: 0,
            errors: VecDeque::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            tool_calls: 0,
            models: HashMap::new(),
            latency: LatencyDigest::new(reservoir),
            start_time_unix_nano: u64::MAX,
            end_time_unix_nano: 0,
            last_attach: now,
        }
    }

    fn apply(&mut self, span: &Arc<SpanRecord>, now: Instant, config: &SessionConfig) {
        self.span_count = self.span_count.saturating_add(1);
        if self.spans.len() < config.max_spans {
            self.spans.push(Arc::clone(span));
        }
        self.services.insert(span.service_name.clone());
        self.trace_ids.insert(span.trace_id);
        self.start_time_unix_nano = self.start_time_unix_nano.min(span.start_time_unix_nano);
        self.end_time_unix_nano = self
            .end_time_unix_nano
            .max(span.end_time_unix_nano.max(span.start_time_unix_nano));

        let usage = TokenUsage::from_span(span);
        self.input_tokens = self.input_tokens.saturating_add(usage.input);
        self.output_tokens = self.output_tokens.saturating_add(usage.output);
        self.cost = (self.cost + usage.cost).min(f64::MAX);

        if is_tool_call(span) {
            self.tool_calls = self.tool_calls.saturating_add(1);
        }
        if let Some(model) = span
            .attribute_str(genai::RESPONSE_MODEL)
            .or_else(|| span.attribute_str(genai::REQUEST_MODEL))
        {
            let uses = self.models.entry(model.to_owned()).or_default();
            *uses = uses.saturating_add(1);
        }

        if span.is_error() {
            self.error_count = self.error_count.saturating_add(1);
            if config.max_errors > 0 {
                if self.errors.len() >= config.max_errors {
                    self.errors.pop_front();
                }
                self.errors.push_back(SessionError {
                    trace_id: span.trace_id,
                    span_id: span.span_id,
                    span_name: span.name.clone(),
                    message: error_message(span),
                    time_unix_nano: span.start_time_unix_nano,
                });
            }
        }

        if let Some(nanos) = span.duration_nanos() {
            self.latency.record(nanos);
        }

        let signal = STATUS_KEYS
            .iter()
            .find_map(|key| span.attribute_str(key))
            .and_then(RunStatus::from_signal);
        match (signal, self.closed_by) {
            (_, Some(ClosedBy::Signal)) => {}
            (Some(status), _) => {
                self.status = status;
                self.closed_by = Some(ClosedBy::Signal);
            }
            (None, Some(ClosedBy::Idle)) => {
                self.status = RunStatus::Running;
                self.closed_by = None;
            }
            (None, None) => {}
        }

        self.last_attach = now;
    }

    fn primary_model(&self) -> Option<String> {
        self.models
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(model, _)| model.clone())
    }

    fn status(&self, session_id: &str) -> SessionStatus {
        let mut models: Vec<ModelUsage> = self
            .models
            .iter()
            .map(|(model, count)| ModelUsage {
                model: model.clone(),
                count: *count,
            })
            .collect();
        models.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));

        let start = if self.span_count == 0 {
            0
        } else {
            self.start_time_unix_nano
        };
        SessionStatus {
            session_id: session_id.to_owned(),
            status: self.status,
            closed_by: self.closed_by,
            services: self.services.iter().cloned().collect(),
            trace_ids: self.trace_ids.iter().copied().collect(),
            span_count: self.span_count,
            error_count: self.error_count,
            errors: self.errors.iter().cloned().collect(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens(),
            cost: self.cost,
            tool_calls: self.tool_calls,
            primary_model: self.primary_model(),
            models,
            latency: self.latency.stats(),
            start_time_unix_nano: start,
            end_time_unix_nano: self.end_time_unix_nano,
        }
    }

    fn matches(&self, query: &SessionQuery) -> bool {
        query.status.map_or(true, |s| self.status == s)
            && query
                .service
                .as_ref()
                .map_or(true, |svc| self.services.contains(svc))
            && query
                .trace_id
                .map_or(true, |t| self.trace_ids.contains(&t))
            && query
                .has_errors
                .map_or(true, |want| (self.error_count > 0) == want)
            && query
                .min_tokens
                .map_or(true, |min| self.total_tokens() >= min)
    }

    const fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

struct TokenUsage {
    input: u64,
    output: u64,
    cost: f64,
}

impl TokenUsage {
    /// Negative counts read as zero; values are capped at `i64::MAX`.
    fn from_span(span: &SpanRecord) -> Self {
        let tokens = |primary: &str, fallback: &str| {
            span.attribute_i64(primary)
                .or_else(|| span.attribute_i64(fallback))
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0)
        };
        Self {
            input: tokens(genai::INPUT_TOKENS, genai::PROMPT_TOKENS),
            output: tokens(genai::OUTPUT_TOKENS, genai::COMPLETION_TOKENS),
            cost: span
                .attribute_f64(genai::COST)
                .filter(|c| c.is_finite() && *c >= 0.0)
                .unwrap_or(0.0),
        }
    }
}

fn is_tool_call(span: &SpanRecord) -> bool {
    match span.attribute_str(genai::OPERATION_NAME) {
        Some(op) => matches!(op, "execute_tool" | "tool_call"),
        None => span.attribute_str(genai::TOOL_NAME).is_some(),
    }
}

fn error_message(span: &SpanRecord) -> String {
    if !span.status.message.is_empty() {
        return span.status.message.clone();
    }
    span.events
        .iter()
        .find_map(|e| e.attributes.get(genai::EXCEPTION_MESSAGE))
        .or_else(|| span.attribute(genai::EXCEPTION_MESSAGE))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("error")
        .to_owned()
}

/// Filter for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub status: Option<RunStatus>,
    pub service: Option<String>,
    pub trace_id: Option<TraceId>,
    pub has_errors: Option<bool>,
    pub min_tokens: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

/// Totals across all tracked sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    /// Sessions created since startup, including evicted ones.
    pub sessions_created: u64,
    pub tracked_sessions: usize,
    pub running_sessions: usize,
    pub total_spans: u64,
    pub total_errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub tool_calls: u64,
    pub top_models: Vec<ModelUsage>,
}

/// Groups spans into sessions and keeps their rollups current.
#[derive(Debug)]
pub struct SessionAggregator {
    sessions: DashMap<SessionId, SessionState>,
    recency: RecencyIndex<SessionId>,
    config: SessionConfig,
    created: AtomicU64,
}

impl SessionAggregator {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            recency: RecencyIndex::new(),
            config: config.clone(),
            created: AtomicU64::new(0),
        }
    }

    /// Attach a span to its session, creating the session on first sight.
    pub fn attach(&self, span: &Arc<SpanRecord>) -> SessionId {
        let session_id = correlation_key(span);
        let now = Instant::now();
        let mut is_new = false;
        {
            let mut state = self
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    is_new = true;
                    SessionState::new(now, self.config.latency_reservoir)
                });
            let previous = state.last_attach;
            state.apply(span, now, &self.config);
            self.recency
                .touch(&session_id, (!is_new).then_some(previous), state.last_attach);
        }

        if is_new {
            self.created.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id = %session_id, "Session started");
            self.enforce_capacity(&session_id);
        }
        session_id
    }

    fn enforce_capacity(&self, keep: &SessionId) {
        while self.sessions.len() > self.config.max_sessions.max(1) {
            let Some((stamp, oldest)) = self.recency.pop_oldest(keep) else {
                break;
            };
            if self
                .sessions
                .remove_if(&oldest, |_, s| s.last_attach == stamp)
                .is_some()
            {
                tracing::debug!(session_id = %oldest, "Evicted session over capacity");
            }
        }
    }

    /// Current rollup for a session, or `None` if unknown.
    pub fn get_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|s| s.status(session_id))
    }

    /// Spans attached to a session, ordered by start time.
    pub fn spans(&self, session_id: &str) -> Option<Vec<Arc<SpanRecord>>> {
        self.sessions.get(session_id).map(|s| {
            let mut spans = s.spans.clone();
            spans.sort_by_key(|span| (span.start_time_unix_nano, span.span_id));
            spans
        })
    }

    /// Sessions matching `query`, most recent activity first.
    pub fn list(&self, query: &SessionQuery) -> Vec<SessionStatus> {
        let mut matching: Vec<(Instant, SessionStatus)> = self
            .sessions
            .iter()
            .filter(|s| s.matches(query))
            .map(|s| (s.last_attach, s.status(s.key())))
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0));
        matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(_, status)| status)
            .collect()
    }

    /// Close running sessions that have been idle for longer than `idle_timeout`.
    ///
    /// Returns the ids of the sessions that were closed.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let mut closed = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.status == RunStatus::Running
                && now.saturating_duration_since(entry.last_attach) > idle_timeout
            {
                entry.status = if entry.error_count > 0 {
                    RunStatus::Failed
                } else {
                    RunStatus::Succeeded
                };
                entry.closed_by = Some(ClosedBy::Idle);
                closed.push(entry.key().clone());
            }
        }
        if !closed.is_empty() {
            tracing::debug!(count = closed.len(), "Closed idle sessions");
        }
        closed
    }

    /// Remove sessions with no activity for longer than `retention`.
    pub fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|id, s| {
            let keep = now.saturating_duration_since(s.last_attach) <= retention;
            if !keep {
                self.recency.forget(id, s.last_attach);
            }
            keep
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired sessions");
        }
        removed
    }

    pub fn statistics(&self) -> SessionStatistics {
        let mut stats = SessionStatistics {
            sessions_created: self.created.load(Ordering::Relaxed),
            tracked_sessions: 0,
            running_sessions: 0,
            total_spans: 0,
            total_errors: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
            tool_calls: 0,
            top_models: Vec::new(),
        };
        let mut models: HashMap<String, u64> = HashMap::new();

        for s in &self.sessions {
            stats.tracked_sessions += 1;
            if s.status == RunStatus::Running {
                stats.running_sessions += 1;
            }
            stats.total_spans = stats.total_spans.saturating_add(s.span_count);
            stats.total_errors = stats.total_errors.saturating_add(s.error_count);
            stats.input_tokens = stats.input_tokens.saturating_add(s.input_tokens);
            stats.output_tokens = stats.output_tokens.saturating_add(s.output_tokens);
            stats.total_cost = (stats.total_cost + s.cost).min(f64::MAX);
            stats.tool_calls = stats.tool_calls.saturating_add(s.tool_calls);
            for (model, count) in &s.models {
                let total = models.entry(model.clone()).or_default();
                *total = total.saturating_add(*count);
            }
        }
        stats.total_tokens = stats.input_tokens.saturating_add(stats.output_tokens);

        let mut top: Vec<ModelUsage> = models
            .into_iter()
            .map(|(model, count)| ModelUsage { model, count })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));
        top.truncate(5);
        stats.top_models = top;
        stats
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
