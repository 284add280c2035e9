//! Trace aggregation.
//!
//! Builds trace trees incrementally from spans as they are stored. Spans may
//! arrive in any order: a child whose parent has not been seen yet is kept
//! and linked as soon as the parent shows up, and a span whose parent never
//! arrives is reported under a synthetic unknown root instead of being lost.
//!
//! Each trace lives in its own `DashMap` entry, so spans for one trace are
//! applied in order under that entry's shard lock while unrelated traces
//! proceed in parallel.
//!
//! Memory is bounded twice: `max_traces` caps the number of traces (least
//! recently updated evicted first) and `max_spans_per_trace` caps each one.
//! Served trees are at most [`MAX_TREE_DEPTH`] levels deep; deeper spans are
//! re-hung under the unknown root with their declared parent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::TraceConfig;
use crate::model::{SpanId, SpanRecord, TraceId};
use crate::recency::RecencyIndex;

/// Levels in one served subtree before the rest is detached.
pub const MAX_TREE_DEPTH: usize = 128;

/// What happened to a span offered to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanAdmission {
    Added,
    /// The trace already holds a span with this id.
    Duplicate,
    /// The trace is at `max_spans_per_trace`; the span was counted and dropped.
    TraceFull,
}

/// Lifecycle phase of a trace.
///
/// A trace id with no spans is simply absent from the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracePhase {
    /// At least one span, no parentless span seen yet.
    Open,
    /// A root span is known.
    Rooted,
    /// No span arrived within the grace period.
    Idle,
}

#[derive(Debug)]
struct TraceState {
    spans: HashMap<SpanId, Arc<SpanRecord>>,
    root: Option<SpanId>,
    services: BTreeSet<String>,
    start_time_unix_nano: u64,
    end_time_unix_nano: u64,
    error_count: usize,
    dropped_spans: u64,
    last_updated: Instant,
}

impl TraceState {
    fn new(now: Instant) -> Self {
        Self {
            spans: HashMap::new(),
            root: None,
            services: BTreeSet::new(),
            start_time_unix_nano: u64::MAX,
            end_time_unix_nano: 0,
            error_count: 0,
            dropped_spans: 0,
            last_updated: now,
        }
    }

    fn add(&mut self, span: Arc<SpanRecord>, now: Instant, max_spans: usize) -> SpanAdmission {
        if self.spans.contains_key(&span.span_id) {
            return SpanAdmission::Duplicate;
        }
        self.last_updated = now;
        if self.spans.len() >= max_spans {
            self.dropped_spans = self.dropped_spans.saturating_add(1);
            return SpanAdmission::TraceFull;
        }

        if span.parent_span_id.is_none() && self.is_better_root(&span) {
            self.root = Some(span.span_id);
        }
        self.services.insert(span.service_name.clone());
        self.start_time_unix_nano = self.start_time_unix_nano.min(span.start_time_unix_nano);
        self.end_time_unix_nano = self.end_time_unix_nano.max(span.end_time_unix_nano);
        if span.is_error() {
            self.error_count += 1;
        }
        self.spans.insert(span.span_id, span);
        SpanAdmission::Added
    }

    /// Parentless spans compete for root by earliest start, then lowest id.
    fn is_better_root(&self, candidate: &SpanRecord) -> bool {
        match self.root.and_then(|id| self.spans.get(&id)) {
            None => true,
            Some(current) => {
                (candidate.start_time_unix_nano, candidate.span_id)
                    < (current.start_time_unix_nano, current.span_id)
            }
        }
    }

    fn phase(&self, now: Instant, grace_period: Duration) -> TracePhase {
        if now.saturating_duration_since(self.last_updated) >= grace_period {
            TracePhase::Idle
        } else if self.root.is_some() {
            TracePhase::Rooted
        } else {
            TracePhase::Open
        }
    }

    fn root_span(&self) -> Option<&Arc<SpanRecord>> {
        self.root.and_then(|id| self.spans.get(&id))
    }

    fn summary(&self, trace_id: TraceId, phase: TracePhase) -> TraceSummary {
        let root = self.root_span();
        let start = if self.spans.is_empty() {
            0
        } else {
            self.start_time_unix_nano
        };
        TraceSummary {
            trace_id,
            phase,
            root_name: root.map(|s| s.name.clone()),
            root_service: root.map(|s| s.service_name.clone()),
            span_count: self.spans.len(),
            services: self.services.iter().cloned().collect(),
            start_time_unix_nano: start,
            end_time_unix_nano: self.end_time_unix_nano,
            duration_nanos: self.end_time_unix_nano.saturating_sub(start),
            error_count: self.error_count,
            has_error: self.error_count > 0,
            dropped_spans: self.dropped_spans,
        }
    }

    fn tree(&self, trace_id: TraceId, phase: TracePhase) -> TraceTree {
        let mut children: HashMap<SpanId, Vec<&Arc<SpanRecord>>> = HashMap::new();
        let mut roots = Vec::new();
        let mut orphans = Vec::new();

        for span in self.spans.values() {
            match span.parent_span_id {
                None => roots.push(span),
                Some(parent) if parent != span.span_id && self.spans.contains_key(&parent) => {
                    children.entry(parent).or_default().push(span);
                }
                Some(_) => orphans.push(span),
            }
        }

        let by_start = |a: &&Arc<SpanRecord>, b: &&Arc<SpanRecord>| {
            (a.start_time_unix_nano, a.span_id).cmp(&(b.start_time_unix_nano, b.span_id))
        };
        for kids in children.values_mut() {
            kids.sort_by(by_start);
        }
        roots.sort_by(by_start);
        // The resolved root is already the earliest parentless span.
        orphans.sort_by(by_start);

        let children: HashMap<SpanId, Vec<SpanId>> = children
            .into_iter()
            .map(|(parent, kids)| (parent, kids.iter().map(|s| s.span_id).collect()))
            .collect();

        let mut visited = HashSet::with_capacity(self.spans.len());
        let mut detached = Vec::new();
        let root_nodes: Vec<TraceNode> = roots
            .iter()
            .filter_map(|s| self.build_subtree(s.span_id, &children, &mut visited, &mut detached))
            .collect();
        let mut unknown: Vec<TraceNode> = orphans
            .iter()
            .filter_map(|s| self.build_subtree(s.span_id, &children, &mut visited, &mut detached))
            .collect();
        self.hang_detached(&mut detached, &children, &mut visited, &mut unknown);

        // Spans only reachable through a parent cycle are still reported.
        if visited.len() < self.spans.len() {
            let mut stranded: Vec<&Arc<SpanRecord>> = self
                .spans
                .values()
                .filter(|s| !visited.contains(&s.span_id))
                .collect();
            stranded.sort_by(by_start);
            for span in stranded {
                if let Some(node) =
                    self.build_subtree(span.span_id, &children, &mut visited, &mut detached)
                {
                    unknown.push(node);
                }
            }
            self.hang_detached(&mut detached, &children, &mut visited, &mut unknown);
        }

        TraceTree {
            trace_id,
            phase,
            root_span_id: self.root,
            span_count: self.spans.len(),
            roots: root_nodes,
            unknown_root: unknown,
        }
    }

    /// Build subtrees for detached spans until none are left, appending them
    /// to the unknown root in start order.
    fn hang_detached(
        &self,
        detached: &mut Vec<SpanId>,
        children: &HashMap<SpanId, Vec<SpanId>>,
        visited: &mut HashSet<SpanId>,
        unknown: &mut Vec<TraceNode>,
    ) {
        while !detached.is_empty() {
            let mut batch = std::mem::take(detached);
            batch.sort_by_key(|id| {
                self.spans
                    .get(id)
                    .map(|s| (s.start_time_unix_nano, s.span_id))
            });
            for id in batch {
                if let Some(node) = self.build_subtree(id, children, visited, detached) {
                    unknown.push(node);
                }
            }
        }
    }

    /// Build the subtree under `root` without recursion.
    ///
    /// Children that would sit at [`MAX_TREE_DEPTH`] are pushed to `detached`
    /// instead of being nested.
    fn build_subtree(
        &self,
        root: SpanId,
        children: &HashMap<SpanId, Vec<SpanId>>,
        visited: &mut HashSet<SpanId>,
        detached: &mut Vec<SpanId>,
    ) -> Option<TraceNode> {
        if !visited.insert(root) {
            return None;
        }

        let mut built: HashMap<SpanId, TraceNode> = HashMap::new();
        let mut stack = vec![(root, 0usize, false)];
        while let Some((id, depth, expanded)) = stack.pop() {
            if expanded {
                let Some(span) = self.spans.get(&id) else {
                    continue;
                };
                let kids = children
                    .get(&id)
                    .map(|ids| ids.iter().filter_map(|k| built.remove(k)).collect())
                    .unwrap_or_default();
                built.insert(
                    id,
                    TraceNode {
                        span: Arc::clone(span),
                        children: kids,
                    },
                );
            } else {
                stack.push((id, depth, true));
                for kid in children.get(&id).into_iter().flatten().rev() {
                    if depth + 1 >= MAX_TREE_DEPTH {
                        if !visited.contains(kid) {
                            detached.push(*kid);
                        }
                    } else if visited.insert(*kid) {
                        stack.push((*kid, depth + 1, false));
                    }
                }
            }
        }
        built.remove(&root)
    }
}

/// A span and its children, ordered by start time.
#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    pub span: Arc<SpanRecord>,
    pub children: Vec<TraceNode>,
}

/// Parent/child view of one trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceTree {
    pub trace_id: TraceId,
    pub phase: TracePhase,
    pub root_span_id: Option<SpanId>,
    pub span_count: usize,
    /// Parentless spans, the resolved root first.
    pub roots: Vec<TraceNode>,
    /// Children of the synthetic unknown root: spans whose parent was never
    /// seen, plus subtrees cut off at [`MAX_TREE_DEPTH`].
    pub unknown_root: Vec<TraceNode>,
}

impl TraceTree {
    /// Every (parent, child) edge in the tree, sorted.
    ///
    /// Top-level spans have parent `None`; spans under the unknown root are
    /// reported with their declared parent id.
    pub fn edges(&self) -> Vec<(Option<SpanId>, SpanId)> {
        let mut edges = Vec::with_capacity(self.span_count);
        let mut stack: Vec<(Option<SpanId>, &TraceNode)> = self
            .roots
            .iter()
            .map(|n| (None, n))
            .chain(self.unknown_root.iter().map(|n| (n.span.parent_span_id, n)))
            .collect();
        while let Some((parent, node)) = stack.pop() {
            edges.push((parent, node.span.span_id));
            stack.extend(node.children.iter().map(|c| (Some(node.span.span_id), c)));
        }
        edges.sort();
        edges
    }

    /// Number of spans reachable from the tree.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TraceNode> = self.roots.iter().chain(&self.unknown_root).collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(&node.children);
        }
        count
    }

    /// Levels in the deepest served subtree.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack: Vec<(usize, &TraceNode)> = self
            .roots
            .iter()
            .chain(&self.unknown_root)
            .map(|n| (1, n))
            .collect();
        while let Some((level, node)) = stack.pop() {
            deepest = deepest.max(level);
            stack.extend(node.children.iter().map(|c| (level + 1, c)));
        }
        deepest
    }
}

/// Summary row for trace listings.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: TraceId,
    pub phase: TracePhase,
    pub root_name: Option<String>,
    pub root_service: Option<String>,
    pub span_count: usize,
    pub services: Vec<String>,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub duration_nanos: u64,
    pub error_count: usize,
    pub has_error: bool,
    /// Spans refused because the trace was full.
    pub dropped_spans: u64,
}

/// Filter for listing traces.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub service: Option<String>,
    pub has_errors: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

/// Incremental trace tree builder keyed by trace id.
#[derive(Debug)]
pub struct TraceAggregator {
    traces: DashMap<TraceId, TraceState>,
    recency: RecencyIndex<TraceId>,
    max_traces: usize,
    max_spans_per_trace: usize,
    grace_period: Duration,
}

impl TraceAggregator {
    #[must_use]
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            traces: DashMap::new(),
            recency: RecencyIndex::new(),
            max_traces: config.max_traces.max(1),
            max_spans_per_trace: config.max_spans_per_trace.max(1),
            grace_period: config.grace_period(),
        }
    }

    /// Add a span to its trace.
    ///
    /// Only [`SpanAdmission::Added`] spans become part of the trace; a
    /// duplicate id changes nothing and a full trace only counts the drop.
    pub fn add_span(&self, span: Arc<SpanRecord>) -> SpanAdmission {
        let now = Instant::now();
        let trace_id = span.trace_id;
        let (admission, is_new) = {
            let mut is_new = false;
            let mut state = self.traces.entry(trace_id).or_insert_with(|| {
                is_new = true;
                TraceState::new(now)
            });
            let previous = state.last_updated;
            let admission = state.add(span, now, self.max_spans_per_trace);
            if admission != SpanAdmission::Duplicate {
                self.recency
                    .touch(&trace_id, (!is_new).then_some(previous), state.last_updated);
            }
            (admission, is_new)
        };

        if admission == SpanAdmission::TraceFull {
            tracing::trace!(trace_id = %trace_id, "Trace full, span dropped");
        }
        if is_new {
            tracing::trace!(trace_id = %trace_id, "Tracking new trace");
            self.enforce_capacity(trace_id);
        }
        admission
    }

    /// Evict least recently updated traces beyond `max_traces`.
    fn enforce_capacity(&self, keep: TraceId) {
        while self.traces.len() > self.max_traces {
            let Some((stamp, oldest)) = self.recency.pop_oldest(&keep) else {
                break;
            };
            if self
                .traces
                .remove_if(&oldest, |_, t| t.last_updated == stamp)
                .is_some()
            {
                tracing::debug!(trace_id = %oldest, "Evicted trace over capacity");
            }
        }
    }

    pub fn phase(&self, trace_id: &TraceId) -> Option<TracePhase> {
        let now = Instant::now();
        self.traces
            .get(trace_id)
            .map(|t| t.phase(now, self.grace_period))
    }

    /// Parent/child tree of a trace, or `None` if the trace is unknown.
    pub fn get_trace_tree(&self, trace_id: &TraceId) -> Option<TraceTree> {
        let now = Instant::now();
        self.traces
            .get(trace_id)
            .map(|t| t.tree(*trace_id, t.phase(now, self.grace_period)))
    }

    pub fn get_summary(&self, trace_id: &TraceId) -> Option<TraceSummary> {
        let now = Instant::now();
        self.traces
            .get(trace_id)
            .map(|t| t.summary(*trace_id, t.phase(now, self.grace_period)))
    }

    /// All spans of a trace ordered by start time.
    pub fn spans(&self, trace_id: &TraceId) -> Option<Vec<Arc<SpanRecord>>> {
        self.traces.get(trace_id).map(|t| {
            let mut spans: Vec<_> = t.spans.values().cloned().collect();
            spans.sort_by_key(|s| (s.start_time_unix_nano, s.span_id));
            spans
        })
    }

    /// Trace summaries, most recently updated first.
    pub fn recent(&self, query: &TraceQuery) -> Vec<TraceSummary> {
        let now = Instant::now();
        let mut matching: Vec<(Instant, TraceSummary)> = self
            .traces
            .iter()
            .filter(|t| {
                query
                    .service
                    .as_ref()
                    .map_or(true, |svc| t.services.contains(svc))
                    && query
                        .has_errors
                        .map_or(true, |want| (t.error_count > 0) == want)
            })
            .map(|t| {
                let phase = t.phase(now, self.grace_period);
                (t.last_updated, t.summary(*t.key(), phase))
            })
            .collect();

        matching.sort_by(|a, b| b.0.cmp(&a.0));
        matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(_, summary)| summary)
            .collect()
    }

    /// Remove traces with no new span for longer than `retention`.
    pub fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.traces.len();
        self.traces.retain(|id, t| {
            let keep = now.saturating_duration_since(t.last_updated) <= retention;
            if !keep {
                self.recency.forget(id, t.last_updated);
            }
            keep
        });
        let removed = before.saturating_sub(self.traces.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired traces");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}
