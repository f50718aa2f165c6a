//! Trace analysis and root-cause correlation for conversational AI evaluation.
//!
//! This crate turns the distributed trace captured during one conversation
//! turn into a diagnosis of why that turn failed its evaluation.
//!
//! # Pipeline
//!
//! ```text
//! RawSegment ──classify──▶ ParsedSpan ──analyze──▶ TraceAnalysis
//!                                                      │
//!                         EvaluationOutcome ──correlate─┴─▶ RootCause
//! ```
//!
//! 1. `classify` types one raw segment document (LLM call, database query,
//!    routing decision, HTTP call).
//! 2. `analyze` assembles every segment of a trace into a span tree with its
//!    critical path and error spans.
//! 3. `coerce_outcome` normalizes a judge payload at the boundary.
//! 4. `correlate` ranks candidate explanations and picks a primary cause,
//!    or reports insufficient evidence.
//!
//! Everything here is synchronous and free of I/O.

pub mod analysis;
pub mod classify;
pub mod correlation;
pub mod outcome;
pub mod span;

pub use analysis::{analyze, EmptyTraceError, TraceAnalysis};
pub use classify::classify;
pub use correlation::{
    correlate, ConfidenceLevel, Correlation, CorrelationConfig, CorrelationConfigBuilder,
    CorrelationType, RootCause,
};
pub use outcome::{coerce_outcome, EvaluationOutcome};
pub use span::{ParsedSpan, RawSegment, SpanKind};

/// Result type for trace analysis.
pub type Result<T> = std::result::Result<T, EmptyTraceError>;
