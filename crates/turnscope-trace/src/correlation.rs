//! Correlation engine
//!
//! Explains a failing evaluation outcome against the trace captured for the
//! same turn. Every heuristic runs independently; the candidates are ranked
//! by confidence and the head becomes the primary root cause when it clears
//! the reporting threshold.
//!
//! `correlate` is a pure function of its inputs.

use serde::{Deserialize, Serialize};

use crate::analysis::TraceAnalysis;
use crate::outcome::EvaluationOutcome;
use crate::span::{ParsedSpan, SpanKind};

/// Candidate explanation kinds.
///
/// Declaration order is the tie-break when two candidates share a
/// confidence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    LatencyBottleneck,
    ModelTruncation,
    RoutingError,
    DownstreamError,
    DataInconsistency,
    Unknown,
}

impl CorrelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationType::LatencyBottleneck => "latency_bottleneck",
            CorrelationType::ModelTruncation => "model_truncation",
            CorrelationType::RoutingError => "routing_error",
            CorrelationType::DownstreamError => "downstream_error",
            CorrelationType::DataInconsistency => "data_inconsistency",
            CorrelationType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CorrelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// `< 0.5` is low, `0.5..=0.8` medium, above `0.8` high.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence < 0.5 {
            ConfidenceLevel::Low
        } else if confidence <= 0.8 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        }
    }
}

/// One candidate explanation backed by trace evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub correlation_type: CorrelationType,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub explanation: String,
    pub evidence_span_ids: Vec<String>,
}

impl Correlation {
    pub fn new(
        correlation_type: CorrelationType,
        confidence: f64,
        explanation: impl Into<String>,
        evidence_span_ids: Vec<String>,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            correlation_type,
            confidence,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            explanation: explanation.into(),
            evidence_span_ids,
        }
    }
}

/// The diagnosis for one failing metric of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub turn_reference: String,
    pub metric_name: String,
    /// Every candidate that fired, highest confidence first.
    pub correlations: Vec<Correlation>,
    pub primary: Correlation,
    pub summary: String,
}

impl RootCause {
    /// True when no candidate cleared the reporting threshold.
    pub fn insufficient_evidence(&self) -> bool {
        self.primary.correlation_type == CorrelationType::Unknown
    }
}

/// Tuning constants for the correlation heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Minimum confidence for a candidate to become the primary cause.
    pub reporting_threshold: f64,
    /// Share of total duration above which one span is a bottleneck.
    pub latency_share_threshold: f64,
    pub latency_min_confidence: f64,
    pub latency_max_confidence: f64,
    pub truncation_confidence: f64,
    pub routing_confidence: f64,
    pub downstream_confidence: f64,
    /// Added to the downstream confidence when an erroring span is on the
    /// critical path.
    pub downstream_critical_path_boost: f64,
    pub data_inconsistency_confidence: f64,
    /// Confidence carried by the synthetic `unknown` primary.
    pub insufficient_evidence_confidence: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            reporting_threshold: 0.7,
            latency_share_threshold: 0.6,
            latency_min_confidence: 0.5,
            latency_max_confidence: 0.95,
            truncation_confidence: 0.8,
            routing_confidence: 0.85,
            downstream_confidence: 0.75,
            downstream_critical_path_boost: 0.1,
            data_inconsistency_confidence: 0.7,
            insufficient_evidence_confidence: 0.2,
        }
    }
}

impl CorrelationConfig {
    pub fn builder() -> CorrelationConfigBuilder {
        CorrelationConfigBuilder::new()
    }
}

/// Builder for CorrelationConfig
pub struct CorrelationConfigBuilder {
    config: CorrelationConfig,
}

impl CorrelationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CorrelationConfig::default(),
        }
    }

    pub fn reporting_threshold(mut self, threshold: f64) -> Self {
        self.config.reporting_threshold = threshold;
        self
    }

    /// Set the bottleneck share and the confidence range it scales over
    pub fn latency(mut self, share_threshold: f64, min_confidence: f64, max_confidence: f64) -> Self {
        self.config.latency_share_threshold = share_threshold;
        self.config.latency_min_confidence = min_confidence;
        self.config.latency_max_confidence = max_confidence;
        self
    }

    pub fn truncation_confidence(mut self, confidence: f64) -> Self {
        self.config.truncation_confidence = confidence;
        self
    }

    pub fn routing_confidence(mut self, confidence: f64) -> Self {
        self.config.routing_confidence = confidence;
        self
    }

    pub fn downstream(mut self, confidence: f64, critical_path_boost: f64) -> Self {
        self.config.downstream_confidence = confidence;
        self.config.downstream_critical_path_boost = critical_path_boost;
        self
    }

    pub fn data_inconsistency_confidence(mut self, confidence: f64) -> Self {
        self.config.data_inconsistency_confidence = confidence;
        self
    }

    pub fn insufficient_evidence_confidence(mut self, confidence: f64) -> Self {
        self.config.insufficient_evidence_confidence = confidence;
        self
    }

    pub fn build(self) -> CorrelationConfig {
        self.config
    }
}

impl Default for CorrelationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagnose one failing outcome against its trace analysis.
pub fn correlate(
    outcome: &EvaluationOutcome,
    analysis: &TraceAnalysis,
    config: &CorrelationConfig,
) -> RootCause {
    let mut correlations: Vec<Correlation> = [
        latency_bottleneck(analysis, config),
        model_truncation(outcome, analysis, config),
        routing_error(outcome, analysis, config),
        downstream_error(analysis, config),
        data_inconsistency(outcome, analysis, config),
    ]
    .into_iter()
    .flatten()
    .collect();

    // stable sort keeps rule order among exact ties
    correlations.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.correlation_type.cmp(&b.correlation_type))
    });

    let primary = match correlations.first() {
        Some(head) if head.confidence >= config.reporting_threshold => head.clone(),
        _ => insufficient_evidence(analysis, correlations.first(), config),
    };

    let summary = format!(
        "Metric '{}' failed (score {:.2} < {:.2}); primary cause: {} ({} confidence, {:.2}).",
        outcome.metric_name,
        outcome.score,
        outcome.threshold,
        primary.correlation_type,
        primary.confidence_level.as_str(),
        primary.confidence,
    );

    tracing::debug!(
        turn_reference = %outcome.turn_reference,
        metric = %outcome.metric_name,
        primary = %primary.correlation_type,
        candidates = correlations.len(),
        "Correlated evaluation failure"
    );

    RootCause {
        turn_reference: outcome.turn_reference.clone(),
        metric_name: outcome.metric_name.clone(),
        correlations,
        primary,
        summary,
    }
}

fn insufficient_evidence(
    analysis: &TraceAnalysis,
    best: Option<&Correlation>,
    config: &CorrelationConfig,
) -> Correlation {
    let explanation = if analysis.is_empty() {
        format!(
            "No spans were available for trace {}; insufficient evidence to determine a cause",
            analysis.trace_id
        )
    } else if let Some(best) = best {
        format!(
            "Best candidate {} ({:.2}) is below the reporting threshold {:.2}; insufficient evidence",
            best.correlation_type, best.confidence, config.reporting_threshold
        )
    } else {
        format!(
            "None of the {} spans in trace {} explain the failure; insufficient evidence",
            analysis.spans.len(),
            analysis.trace_id
        )
    };
    let confidence = config
        .insufficient_evidence_confidence
        .min(config.reporting_threshold);
    Correlation::new(CorrelationType::Unknown, confidence, explanation, Vec::new())
}

/// Largest non-outermost span on the critical path taking over the share
/// threshold of the total duration.
fn latency_bottleneck(analysis: &TraceAnalysis, config: &CorrelationConfig) -> Option<Correlation> {
    if analysis.total_duration_ms <= 0.0 {
        return None;
    }
    let span = analysis
        .critical_path_spans()
        .skip(1)
        .fold(None::<&ParsedSpan>, |best, s| match best {
            Some(b) if b.duration_ms >= s.duration_ms => Some(b),
            _ => Some(s),
        })?;

    let share = span.duration_ms / analysis.total_duration_ms;
    if share <= config.latency_share_threshold {
        return None;
    }
    let span_range = (1.0 - config.latency_share_threshold).max(f64::EPSILON);
    let position = ((share - config.latency_share_threshold) / span_range).clamp(0.0, 1.0);
    let confidence = config.latency_min_confidence
        + position * (config.latency_max_confidence - config.latency_min_confidence);

    Some(Correlation::new(
        CorrelationType::LatencyBottleneck,
        confidence,
        format!(
            "{} span '{}' took {:.0}ms, {:.0}% of the {:.0}ms trace",
            span.kind,
            span.name,
            span.duration_ms,
            share * 100.0,
            analysis.total_duration_ms
        ),
        vec![span.span_id.clone()],
    ))
}

fn model_truncation(
    outcome: &EvaluationOutcome,
    analysis: &TraceAnalysis,
    config: &CorrelationConfig,
) -> Option<Correlation> {
    if !outcome.is_response_quality_failure() {
        return None;
    }
    let span = analysis
        .critical_path_spans()
        .filter(|s| s.kind == SpanKind::LlmCall)
        .find(|s| is_truncated(s))?;

    let detail = match (span.attribute_f64("completion_tokens"), span.attribute_f64("max_tokens")) {
        (Some(used), Some(max)) => format!("{} of {} completion tokens", used, max),
        _ => format!(
            "stop reason '{}'",
            span.attribute_str("stop_reason").unwrap_or("length")
        ),
    };
    Some(Correlation::new(
        CorrelationType::ModelTruncation,
        config.truncation_confidence,
        format!(
            "LLM call '{}' hit its output limit ({}) while '{}' failed",
            span.name, detail, outcome.metric_name
        ),
        vec![span.span_id.clone()],
    ))
}

fn is_truncated(span: &ParsedSpan) -> bool {
    let by_tokens = match (span.attribute_f64("completion_tokens"), span.attribute_f64("max_tokens")) {
        (Some(used), Some(max)) => max > 0.0 && used >= max,
        _ => false,
    };
    let by_stop_reason = span
        .attribute_str("stop_reason")
        .map(|r| matches!(r.to_ascii_lowercase().as_str(), "length" | "max_tokens"))
        .unwrap_or(false);
    by_tokens || by_stop_reason
}

fn routing_error(
    outcome: &EvaluationOutcome,
    analysis: &TraceAnalysis,
    config: &CorrelationConfig,
) -> Option<Correlation> {
    let expected = outcome.expected_route.as_deref()?;
    let mismatched: Vec<&ParsedSpan> = analysis
        .spans
        .iter()
        .filter(|s| s.kind == SpanKind::AgentRouting)
        .filter(|s| {
            s.attribute_str("route_target")
                .map(|target| !target.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        })
        .collect();
    let first = mismatched.first()?;

    Some(Correlation::new(
        CorrelationType::RoutingError,
        config.routing_confidence,
        format!(
            "Routing span '{}' chose '{}' but '{}' was expected",
            first.name,
            first.attribute_str("route_target").unwrap_or_default(),
            expected
        ),
        mismatched.iter().map(|s| s.span_id.clone()).collect(),
    ))
}

/// Spans that failed themselves, excluding the outermost span whose error
/// only reflects what happened beneath it.
fn downstream_error(analysis: &TraceAnalysis, config: &CorrelationConfig) -> Option<Correlation> {
    let outermost = analysis.outermost_span().map(|s| s.span_id.as_str());
    let failing: Vec<&ParsedSpan> = analysis
        .error_spans
        .iter()
        .filter(|id| Some(id.as_str()) != outermost)
        .filter_map(|id| analysis.span(id))
        .filter(|s| s.is_error)
        .collect();
    let first = failing.first()?;

    let on_critical_path = failing.iter().any(|s| analysis.is_on_critical_path(&s.span_id));
    let confidence = if on_critical_path {
        config.downstream_confidence + config.downstream_critical_path_boost
    } else {
        config.downstream_confidence
    };

    let cause = first
        .attribute_str("error_cause")
        .map(|c| format!(": {}", c))
        .unwrap_or_default();
    Some(Correlation::new(
        CorrelationType::DownstreamError,
        confidence,
        format!(
            "{} downstream span(s) failed, first '{}' ({}){}",
            failing.len(),
            first.name,
            first.kind,
            cause
        ),
        failing.iter().map(|s| s.span_id.clone()).collect(),
    ))
}

fn data_inconsistency(
    outcome: &EvaluationOutcome,
    analysis: &TraceAnalysis,
    config: &CorrelationConfig,
) -> Option<Correlation> {
    if !outcome.claims_data_found {
        return None;
    }
    let empty: Vec<&ParsedSpan> = analysis
        .spans
        .iter()
        .filter(|s| s.kind == SpanKind::DatabaseQuery)
        .filter(|s| s.attribute_f64("row_count") == Some(0.0))
        .collect();
    let first = empty.first()?;

    Some(Correlation::new(
        CorrelationType::DataInconsistency,
        config.data_inconsistency_confidence,
        format!(
            "Query '{}' returned 0 rows but the response claimed data was found",
            first.name
        ),
        empty.iter().map(|s| s.span_id.clone()).collect(),
    ))
}
