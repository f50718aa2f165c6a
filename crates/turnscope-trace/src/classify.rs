//! Span classification
//!
//! Turns one raw segment document into a typed `ParsedSpan`. Classification
//! is total: a malformed document yields an `unknown` span with zeroed
//! timings, never an error.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::span::{value_as_f64, ParsedSpan, RawSegment, SpanKind};

const MODEL_KEYS: &[&str] = &["model_id", "model", "gen_ai.request.model", "llm.model"];
const PROMPT_TOKEN_KEYS: &[&str] = &[
    "prompt_tokens",
    "input_tokens",
    "gen_ai.usage.prompt_tokens",
    "gen_ai.usage.input_tokens",
];
const COMPLETION_TOKEN_KEYS: &[&str] = &[
    "completion_tokens",
    "output_tokens",
    "gen_ai.usage.completion_tokens",
    "gen_ai.usage.output_tokens",
];
const MAX_TOKEN_KEYS: &[&str] = &["max_tokens", "gen_ai.request.max_tokens", "max_output_tokens"];
const STOP_REASON_KEYS: &[&str] = &["stop_reason", "finish_reason", "gen_ai.response.finish_reasons"];
const QUERY_KEYS: &[&str] = &["db.statement", "query", "sql_query"];
const ROW_COUNT_KEYS: &[&str] = &["row_count", "rows_returned", "rows", "db.row_count"];
const ROUTE_KEYS: &[&str] = &[
    "chosen_agent",
    "chosen_handler",
    "route_target",
    "routed_to",
    "selected_agent",
];

/// Classify one raw segment.
///
/// Rule order, first match wins: LLM annotations, SQL annotations, a routing
/// decision, an `http` sub-block, otherwise `unknown`. `is_error` is set when
/// the segment or one of its immediate subsegments carries a fault flag.
pub fn classify(segment: &RawSegment) -> ParsedSpan {
    let span_id = segment.id().unwrap_or_default().to_string();
    let parent_span_id = segment.parent_id().map(str::to_string);
    let name = segment
        .field("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
        .to_string();

    let is_error = segment.has_fault_flag()
        || segment
            .subsegments()
            .iter()
            .any(RawSegment::has_fault_flag);

    let Some(object) = segment.object() else {
        return ParsedSpan {
            span_id,
            parent_span_id,
            kind: SpanKind::Unknown,
            name,
            start_offset_ms: 0.0,
            duration_ms: 0.0,
            is_error,
            attributes: malformed_attributes(),
        };
    };

    let start = read_time(object, "start_time");
    let end = read_time(object, "end_time");
    // an in-progress segment may lack an end, but never a start
    let malformed = !matches!(start, TimeField::Seconds(_)) || matches!(end, TimeField::Malformed);

    let (start_offset_ms, duration_ms) = match start.seconds() {
        Some(start_s) if !malformed => {
            let duration = end
                .seconds()
                .map(|end_s| ((end_s - start_s) * 1000.0).max(0.0))
                .unwrap_or(0.0);
            (start_s * 1000.0, duration)
        }
        _ => (0.0, 0.0),
    };

    let annotations = Annotations::collect(object);
    let mut attributes = BTreeMap::new();

    let kind = if malformed {
        attributes.insert("malformed".to_string(), Value::Bool(true));
        SpanKind::Unknown
    } else if annotations.has_any(MODEL_KEYS)
        || annotations.has_any(PROMPT_TOKEN_KEYS)
        || annotations.has_any(COMPLETION_TOKEN_KEYS)
    {
        copy_first(&annotations, MODEL_KEYS, "model_id", &mut attributes);
        copy_numeric(&annotations, PROMPT_TOKEN_KEYS, "prompt_tokens", &mut attributes);
        copy_numeric(&annotations, COMPLETION_TOKEN_KEYS, "completion_tokens", &mut attributes);
        copy_numeric(&annotations, MAX_TOKEN_KEYS, "max_tokens", &mut attributes);
        copy_first(&annotations, STOP_REASON_KEYS, "stop_reason", &mut attributes);
        SpanKind::LlmCall
    } else if object.get("sql").map(Value::is_object).unwrap_or(false)
        || annotations.has_any(QUERY_KEYS)
    {
        let sql = object.get("sql").and_then(Value::as_object);
        let query = sql
            .and_then(|s| s.get("sanitized_query").or_else(|| s.get("query")))
            .cloned()
            .or_else(|| annotations.first(QUERY_KEYS).cloned());
        if let Some(query) = query {
            attributes.insert("query".to_string(), query);
        }
        let row_count = sql
            .and_then(|s| ROW_COUNT_KEYS.iter().find_map(|k| s.get(*k)))
            .or_else(|| annotations.first(ROW_COUNT_KEYS));
        if let Some(rows) = row_count.and_then(value_as_f64) {
            attributes.insert("row_count".to_string(), number(rows));
        }
        if let Some(db) = sql.and_then(|s| s.get("database_type")) {
            attributes.insert("database_type".to_string(), db.clone());
        }
        SpanKind::DatabaseQuery
    } else if annotations.has_any(ROUTE_KEYS) {
        copy_first(&annotations, ROUTE_KEYS, "route_target", &mut attributes);
        SpanKind::AgentRouting
    } else if let Some(http) = object.get("http").and_then(Value::as_object) {
        let request = http.get("request").and_then(Value::as_object);
        if let Some(method) = request.and_then(|r| r.get("method")) {
            attributes.insert("http_method".to_string(), method.clone());
        }
        if let Some(url) = request.and_then(|r| r.get("url")) {
            attributes.insert("http_url".to_string(), url.clone());
        }
        let status = http
            .get("response")
            .and_then(Value::as_object)
            .and_then(|r| r.get("status"))
            .and_then(value_as_f64);
        if let Some(status) = status {
            attributes.insert("http_status".to_string(), number(status));
        }
        SpanKind::HttpCall
    } else {
        SpanKind::Unknown
    };

    if let Some(cause) = error_cause(object) {
        attributes.insert("error_cause".to_string(), Value::String(cause));
    }

    ParsedSpan {
        span_id,
        parent_span_id,
        kind,
        name,
        start_offset_ms,
        duration_ms,
        is_error,
        attributes,
    }
}

enum TimeField {
    Missing,
    Malformed,
    Seconds(f64),
}

impl TimeField {
    fn seconds(&self) -> Option<f64> {
        match self {
            TimeField::Seconds(s) => Some(*s),
            _ => None,
        }
    }
}

fn read_time(object: &Map<String, Value>, key: &str) -> TimeField {
    match object.get(key) {
        None | Some(Value::Null) => TimeField::Missing,
        Some(value) => match value_as_f64(value) {
            Some(seconds) if seconds >= 0.0 => TimeField::Seconds(seconds),
            _ => TimeField::Malformed,
        },
    }
}

/// Annotation and metadata values searched during classification.
///
/// Annotations take precedence; metadata namespaces are flattened one level.
struct Annotations<'a> {
    entries: Vec<(&'a str, &'a Value)>,
}

impl<'a> Annotations<'a> {
    fn collect(object: &'a Map<String, Value>) -> Self {
        let mut entries = Vec::new();
        if let Some(annotations) = object.get("annotations").and_then(Value::as_object) {
            entries.extend(annotations.iter().map(|(k, v)| (k.as_str(), v)));
        }
        if let Some(metadata) = object.get("metadata").and_then(Value::as_object) {
            for (key, value) in metadata {
                match value.as_object() {
                    Some(namespace) => {
                        entries.extend(namespace.iter().map(|(k, v)| (k.as_str(), v)))
                    }
                    None => entries.push((key.as_str(), value)),
                }
            }
        }
        Self { entries }
    }

    fn first(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|key| {
            self.entries
                .iter()
                .find(|(k, v)| k == key && !v.is_null())
                .map(|(_, v)| *v)
        })
    }

    fn has_any(&self, keys: &[&str]) -> bool {
        self.first(keys).is_some()
    }
}

fn copy_first(
    annotations: &Annotations<'_>,
    keys: &[&str],
    target: &str,
    attributes: &mut BTreeMap<String, Value>,
) {
    if let Some(value) = annotations.first(keys) {
        attributes.insert(target.to_string(), value.clone());
    }
}

fn copy_numeric(
    annotations: &Annotations<'_>,
    keys: &[&str],
    target: &str,
    attributes: &mut BTreeMap<String, Value>,
) {
    if let Some(value) = annotations.first(keys).and_then(value_as_f64) {
        attributes.insert(target.to_string(), number(value));
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn error_cause(object: &Map<String, Value>) -> Option<String> {
    match object.get("cause")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(cause) => cause
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| {
                cause
                    .get("exceptions")
                    .and_then(Value::as_array)
                    .and_then(|e| e.first())
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string),
        _ => None,
    }
}

fn malformed_attributes() -> BTreeMap<String, Value> {
    let mut attributes = BTreeMap::new();
    attributes.insert("malformed".to_string(), Value::Bool(true));
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segment(value: Value) -> RawSegment {
        RawSegment::new(value)
    }

    #[test]
    fn test_llm_annotations_win_over_http() {
        let span = classify(&segment(json!({
            "id": "a1",
            "name": "bedrock",
            "start_time": 10.0,
            "end_time": 10.25,
            "http": {"response": {"status": 200}},
            "annotations": {"model_id": "claude", "completion_tokens": 512, "max_tokens": "512"}
        })));
        assert_eq!(span.kind, SpanKind::LlmCall);
        assert_eq!(span.duration_ms, 250.0);
        assert_eq!(span.start_offset_ms, 10_000.0);
        assert_eq!(span.attribute_f64("completion_tokens"), Some(512.0));
        assert_eq!(span.attribute_f64("max_tokens"), Some(512.0));
        assert_eq!(span.attribute_str("model_id"), Some("claude"));
    }

    #[test]
    fn test_sql_block_is_database_query() {
        let span = classify(&segment(json!({
            "id": "q1",
            "name": "orders-db",
            "start_time": 1.0,
            "end_time": 1.45,
            "sql": {"sanitized_query": "SELECT * FROM orders", "row_count": 0}
        })));
        assert_eq!(span.kind, SpanKind::DatabaseQuery);
        assert_eq!(span.attribute_f64("row_count"), Some(0.0));
        assert_eq!(span.attribute_str("query"), Some("SELECT * FROM orders"));
    }

    #[test]
    fn test_routing_annotation_in_metadata() {
        let span = classify(&segment(json!({
            "id": "r1",
            "name": "router",
            "start_time": 1.0,
            "end_time": 1.01,
            "metadata": {"default": {"chosen_agent": "billing"}}
        })));
        assert_eq!(span.kind, SpanKind::AgentRouting);
        assert_eq!(span.attribute_str("route_target"), Some("billing"));
    }

    #[test]
    fn test_http_block() {
        let span = classify(&segment(json!({
            "id": "h1",
            "name": "api",
            "start_time": 1.0,
            "end_time": 1.5,
            "http": {"request": {"method": "POST", "url": "https://x"}, "response": {"status": 502}}
        })));
        assert_eq!(span.kind, SpanKind::HttpCall);
        assert_eq!(span.attribute_f64("http_status"), Some(502.0));
        assert_eq!(span.attribute_str("http_method"), Some("POST"));
    }

    #[test]
    fn test_negative_duration_is_clamped() {
        let span = classify(&segment(json!({
            "id": "x", "name": "skewed", "start_time": 5.0, "end_time": 4.0
        })));
        assert_eq!(span.duration_ms, 0.0);
        assert_eq!(span.kind, SpanKind::Unknown);
    }

    #[test]
    fn test_malformed_timing_is_unknown() {
        let span = classify(&segment(json!({
            "id": "m",
            "name": "broken",
            "start_time": "yesterday",
            "end_time": 4.0,
            "annotations": {"model_id": "claude"}
        })));
        assert_eq!(span.kind, SpanKind::Unknown);
        assert_eq!(span.duration_ms, 0.0);
        assert_eq!(span.start_offset_ms, 0.0);
        assert_eq!(span.attribute("malformed"), Some(&Value::Bool(true)));
        assert!(span.is_malformed());
    }

    #[test]
    fn test_missing_start_is_malformed() {
        let span = classify(&segment(json!({
            "id": "m", "name": "late", "end_time": 1_700_000_000.4,
            "annotations": {"model_id": "claude"}
        })));
        assert!(span.is_malformed());
        assert_eq!(span.kind, SpanKind::Unknown);
        assert_eq!(span.start_offset_ms, 0.0);

        let open = classify(&segment(json!({"id": "o", "name": "open", "start_time": 3.0})));
        assert!(!open.is_malformed());
        assert_eq!(open.start_offset_ms, 3000.0);
        assert_eq!(open.duration_ms, 0.0);
    }

    #[test]
    fn test_non_object_document() {
        let span = classify(&segment(json!([1, 2, 3])));
        assert_eq!(span.kind, SpanKind::Unknown);
        assert_eq!(span.name, "unnamed");
        assert!(span.span_id.is_empty());
    }

    #[test]
    fn test_child_fault_propagates_one_level() {
        let span = classify(&segment(json!({
            "id": "p",
            "name": "parent",
            "start_time": 1.0,
            "end_time": 2.0,
            "subsegments": [
                {"id": "c", "name": "child", "start_time": 1.0, "end_time": 1.5, "fault": true,
                 "subsegments": []}
            ]
        })));
        assert!(span.is_error);

        let grandparent = classify(&segment(json!({
            "id": "g",
            "name": "grandparent",
            "subsegments": [{"id": "p", "subsegments": [{"id": "c", "fault": true}]}]
        })));
        assert!(!grandparent.is_error);
    }

    #[test]
    fn test_error_cause_recorded() {
        let span = classify(&segment(json!({
            "id": "e",
            "name": "call",
            "start_time": 1.0,
            "end_time": 2.0,
            "error": true,
            "cause": {"exceptions": [{"message": "connection reset"}]}
        })));
        assert!(span.is_error);
        assert_eq!(span.attribute_str("error_cause"), Some("connection reset"));
    }
}
