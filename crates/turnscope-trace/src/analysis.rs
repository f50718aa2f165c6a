//! Trace analysis
//!
//! Assembles the raw segments of one trace into a `TraceAnalysis`: the span
//! tree, total duration, critical path and error spans.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::classify::classify;
use crate::span::{ParsedSpan, RawSegment, SpanKind};

/// Tolerance used when comparing end offsets. Epoch-second timestamps keep
/// only sub-microsecond precision once converted to milliseconds.
const END_EPSILON_MS: f64 = 1e-3;

/// Returned when a trace has no segments at all.
///
/// This signals "no data", not a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("trace {trace_id} has no segments")]
pub struct EmptyTraceError {
    pub trace_id: String,
}

/// The parsed result for one trace id.
///
/// Invariants: `critical_path` is empty iff `spans` is empty, and every id in
/// `critical_path` and `error_spans` names a span in `spans`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceAnalysis {
    pub trace_id: String,
    pub spans: Vec<ParsedSpan>,
    pub total_duration_ms: f64,
    pub critical_path: Vec<String>,
    pub error_spans: Vec<String>,
    pub span_kind_counts: BTreeMap<SpanKind, usize>,
}

impl TraceAnalysis {
    /// An analysis with no spans, used when the trace could not be retrieved.
    pub fn empty(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans: Vec::new(),
            total_duration_ms: 0.0,
            critical_path: Vec::new(),
            error_spans: Vec::new(),
            span_kind_counts: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn span(&self, span_id: &str) -> Option<&ParsedSpan> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    pub fn is_on_critical_path(&self, span_id: &str) -> bool {
        self.critical_path.iter().any(|id| id == span_id)
    }

    /// The first span of the critical path: the trace's outermost span.
    pub fn outermost_span(&self) -> Option<&ParsedSpan> {
        self.critical_path.first().and_then(|id| self.span(id))
    }

    /// Spans of the critical path, in root-to-leaf order.
    pub fn critical_path_spans(&self) -> impl Iterator<Item = &ParsedSpan> {
        self.critical_path.iter().filter_map(|id| self.span(id))
    }

    pub fn children_of<'a>(&'a self, span_id: &'a str) -> impl Iterator<Item = &'a ParsedSpan> {
        self.spans
            .iter()
            .filter(move |s| s.parent_span_id.as_deref() == Some(span_id))
    }
}

/// Analyze the raw segments of one trace.
///
/// Nested subsegments are flattened and inherit their enclosing segment as
/// parent. Parent ids that resolve to no span in the trace are dropped, so a
/// partially sampled trace becomes a forest of roots.
pub fn analyze(
    trace_id: impl Into<String>,
    raw_segments: &[RawSegment],
) -> crate::Result<TraceAnalysis> {
    let trace_id = trace_id.into();
    if raw_segments.is_empty() {
        return Err(EmptyTraceError { trace_id });
    }

    let mut spans = Vec::new();
    let mut seen_ids = HashSet::new();
    for segment in raw_segments {
        flatten(segment, None, &mut spans, &mut seen_ids);
    }

    let known: HashSet<String> = spans.iter().map(|s| s.span_id.clone()).collect();
    for span in &mut spans {
        let dangling = span
            .parent_span_id
            .as_ref()
            .map(|p| !known.contains(p) || *p == span.span_id)
            .unwrap_or(false);
        if dangling {
            tracing::debug!(
                span_id = %span.span_id,
                parent_span_id = ?span.parent_span_id,
                "Unresolved parent, treating span as a root"
            );
            span.parent_span_id = None;
        }
    }

    rebase(&mut spans);

    let total_duration_ms = spans
        .iter()
        .map(ParsedSpan::end_offset_ms)
        .fold(0.0, f64::max);

    let (critical_path, error_spans, promoted) = {
        let tree = SpanTree::new(&spans);
        (tree.critical_path(), tree.error_spans(), tree.promoted.clone())
    };
    for i in promoted {
        spans[i].parent_span_id = None;
    }

    let mut span_kind_counts = BTreeMap::new();
    for span in &spans {
        *span_kind_counts.entry(span.kind).or_insert(0) += 1;
    }

    Ok(TraceAnalysis {
        trace_id,
        spans,
        total_duration_ms,
        critical_path,
        error_spans,
        span_kind_counts,
    })
}

/// Shift offsets so the earliest well-timed span starts at 0.
///
/// Malformed spans carry no usable time and take no part in finding the
/// earliest start. They are pinned to their parent's offset, or to 0.
fn rebase(spans: &mut [ParsedSpan]) {
    let earliest = spans
        .iter()
        .filter(|s| !s.is_malformed())
        .map(|s| s.start_offset_ms)
        .fold(f64::INFINITY, f64::min);
    if !earliest.is_finite() {
        return;
    }

    for span in spans.iter_mut().filter(|s| !s.is_malformed()) {
        span.start_offset_ms -= earliest;
    }

    let timed: HashMap<String, f64> = spans
        .iter()
        .filter(|s| !s.is_malformed())
        .map(|s| (s.span_id.clone(), s.start_offset_ms))
        .collect();
    for span in spans.iter_mut().filter(|s| s.is_malformed()) {
        span.start_offset_ms = span
            .parent_span_id
            .as_ref()
            .and_then(|p| timed.get(p))
            .copied()
            .unwrap_or(0.0);
    }
}

/// Classify a segment and its nested subsegments, depth first.
fn flatten(
    segment: &RawSegment,
    enclosing: Option<&str>,
    spans: &mut Vec<ParsedSpan>,
    seen_ids: &mut HashSet<String>,
) {
    let mut span = classify(segment);
    if span.span_id.is_empty() || seen_ids.contains(&span.span_id) {
        span.span_id = format!("anonymous-{}", spans.len());
    }
    if span.parent_span_id.is_none() {
        span.parent_span_id = enclosing.map(str::to_string);
    }
    seen_ids.insert(span.span_id.clone());

    let span_id = span.span_id.clone();
    spans.push(span);
    for child in segment.subsegments() {
        flatten(&child, Some(&span_id), spans, seen_ids);
    }
}

/// Index-based view of the parent links.
struct SpanTree<'a> {
    spans: &'a [ParsedSpan],
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
    parent: Vec<Option<usize>>,
    subtree_end: Vec<f64>,
    promoted: Vec<usize>,
}

impl<'a> SpanTree<'a> {
    fn new(spans: &'a [ParsedSpan]) -> Self {
        let index: HashMap<&str, usize> = spans
            .iter()
            .enumerate()
            .map(|(i, s)| (s.span_id.as_str(), i))
            .collect();

        let mut roots = Vec::new();
        let mut children = vec![Vec::new(); spans.len()];
        let mut parent = vec![None; spans.len()];
        for (i, span) in spans.iter().enumerate() {
            match span.parent_span_id.as_deref().and_then(|p| index.get(p)) {
                Some(&p) => {
                    children[p].push(i);
                    parent[i] = Some(p);
                }
                None => roots.push(i),
            }
        }

        let mut tree = Self {
            spans,
            roots,
            children,
            parent,
            subtree_end: vec![0.0; spans.len()],
            promoted: Vec::new(),
        };
        tree.break_cycles();
        tree.compute_subtree_ends();
        tree
    }

    /// Parent links that loop back on themselves leave no root; promote the
    /// first span of each unreachable group so every span hangs off a root.
    fn break_cycles(&mut self) {
        loop {
            let reachable = self.reachable();
            let Some(orphan) = (0..self.spans.len()).find(|i| !reachable[*i]) else {
                break;
            };
            if let Some(p) = self.parent[orphan].take() {
                self.children[p].retain(|c| *c != orphan);
            }
            self.roots.push(orphan);
            self.promoted.push(orphan);
        }
    }

    fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.spans.len()];
        let mut stack: Vec<usize> = self.roots.clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend(self.children[i].iter().copied());
            }
        }
        seen
    }

    fn compute_subtree_ends(&mut self) {
        let order = self.post_order();
        for i in order {
            let own = self.spans[i].end_offset_ms();
            let deepest = self.children[i]
                .iter()
                .map(|c| self.subtree_end[*c])
                .fold(own, f64::max);
            self.subtree_end[i] = deepest;
        }
    }

    fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.spans.len());
        let mut stack: Vec<(usize, bool)> = self.roots.iter().rev().map(|r| (*r, false)).collect();
        while let Some((i, expanded)) = stack.pop() {
            if expanded {
                order.push(i);
            } else {
                stack.push((i, true));
                stack.extend(self.children[i].iter().rev().map(|c| (*c, false)));
            }
        }
        order
    }

    /// Slowest chain: start at the root whose subtree ends last, then keep
    /// descending into the child whose subtree reaches that same end. The
    /// chain stops at the span that itself ends last.
    fn critical_path(&self) -> Vec<String> {
        let Some(mut current) = pick_latest(&self.roots, &self.subtree_end) else {
            return Vec::new();
        };
        let target = self.subtree_end[current];

        let mut path = vec![self.spans[current].span_id.clone()];
        loop {
            let next = self.children[current]
                .iter()
                .copied()
                .find(|c| (self.subtree_end[*c] - target).abs() <= END_EPSILON_MS);
            match next {
                Some(child) => {
                    path.push(self.spans[child].span_id.clone());
                    current = child;
                }
                None => break,
            }
        }
        path
    }

    /// Erroring spans and all their ancestors, in span order.
    fn error_spans(&self) -> Vec<String> {
        let mut marked = vec![false; self.spans.len()];
        for (i, span) in self.spans.iter().enumerate() {
            if !span.is_error {
                continue;
            }
            let mut cursor = Some(i);
            while let Some(c) = cursor {
                if marked[c] {
                    break;
                }
                marked[c] = true;
                cursor = self.parent[c];
            }
        }
        self.spans
            .iter()
            .zip(marked)
            .filter(|(_, m)| *m)
            .map(|(s, _)| s.span_id.clone())
            .collect()
    }
}

/// First candidate with the greatest subtree end.
fn pick_latest(candidates: &[usize], subtree_end: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for &c in candidates {
        match best {
            Some(b) if subtree_end[c] <= subtree_end[b] + END_EPSILON_MS => {}
            _ => best = Some(c),
        }
    }
    best
}
