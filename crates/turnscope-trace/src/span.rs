//! Span types produced from raw trace segments.
//!
//! Defines `RawSegment` (one undecoded segment document as delivered by the
//! tracing store), `SpanKind` and the normalized `ParsedSpan`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Kind of work a span represents.
///
/// Declaration order is the classification precedence: the first kind whose
/// markers a segment carries wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    LlmCall,
    DatabaseQuery,
    AgentRouting,
    HttpCall,
    Unknown,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::LlmCall => "llm_call",
            SpanKind::DatabaseQuery => "database_query",
            SpanKind::AgentRouting => "agent_routing",
            SpanKind::HttpCall => "http_call",
            SpanKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized unit of work inside a trace.
///
/// Spans form a tree via `parent_span_id`. Times are milliseconds; once a
/// span has passed through the analyzer `start_offset_ms` is relative to the
/// earliest span of its trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSpan {
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub start_offset_ms: f64,
    pub duration_ms: f64,
    pub is_error: bool,
    pub attributes: BTreeMap<String, Value>,
}

impl ParsedSpan {
    /// Offset at which this span ends.
    pub fn end_offset_ms(&self) -> f64 {
        self.start_offset_ms + self.duration_ms
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Whether classification could not read this span's timing.
    pub fn is_malformed(&self) -> bool {
        matches!(self.attributes.get("malformed"), Some(Value::Bool(true)))
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Numeric attribute, accepting numeric strings.
    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(value_as_f64)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// One raw trace segment or subsegment document.
///
/// The document is kept as untyped JSON: tracing backends disagree on field
/// shapes, and classification must never fail on a malformed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSegment {
    document: Value,
}

impl RawSegment {
    /// Wrap a segment document.
    ///
    /// A JSON string holding an encoded document (the X-Ray `Document`
    /// field) is decoded; an undecodable string is kept as-is and later
    /// classified as an `unknown` span.
    pub fn new(document: Value) -> Self {
        let document = match document {
            Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
                Ok(decoded @ Value::Object(_)) => decoded,
                _ => Value::String(encoded),
            },
            other => other,
        };
        Self { document }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub(crate) fn object(&self) -> Option<&Map<String, Value>> {
        self.document.as_object()
    }

    pub(crate) fn field(&self, key: &str) -> Option<&Value> {
        self.object().and_then(|o| o.get(key))
    }

    pub fn id(&self) -> Option<&str> {
        self.field("id").and_then(Value::as_str)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.field("parent_id").and_then(Value::as_str)
    }

    /// Subsegments nested inside this document.
    pub fn subsegments(&self) -> Vec<RawSegment> {
        self.field("subsegments")
            .and_then(Value::as_array)
            .map(|children| children.iter().cloned().map(RawSegment::new).collect())
            .unwrap_or_default()
    }

    /// Whether this document sets its own error, fault or throttle flag.
    pub fn has_fault_flag(&self) -> bool {
        ["error", "fault", "throttle"]
            .iter()
            .any(|flag| self.field(flag).map(value_is_truthy).unwrap_or(false))
    }
}

impl From<Value> for RawSegment {
    fn from(document: Value) -> Self {
        RawSegment::new(document)
    }
}

/// Lenient numeric read: numbers and numeric strings.
pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub(crate) fn value_is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
