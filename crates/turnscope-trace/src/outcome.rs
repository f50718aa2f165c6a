//! Evaluation outcomes reported by the judge.
//!
//! Judges return heterogeneous payloads (scores as numbers, strings or nested
//! objects, pass flags under several names). `coerce_outcome` normalizes any
//! JSON value into the fixed `EvaluationOutcome` shape and never fails.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::span::{value_as_f64, value_is_truthy};

pub const DEFAULT_METRIC_NAME: &str = "unknown_metric";
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Reasoning phrases that indicate the response asserted data was found.
const DATA_CLAIM_PHRASES: &[&str] = &[
    "claimed data",
    "claims data",
    "data was found",
    "reported finding",
    "fabricated",
];

/// Metrics that judge the quality of the response text itself.
const RESPONSE_QUALITY_METRICS: &[&str] = &[
    "completeness",
    "coherence",
    "relevance",
    "relevancy",
    "helpfulness",
    "fluency",
    "response_quality",
    "answer_quality",
    "conciseness",
];

/// One metric verdict for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub turn_reference: String,
    pub metric_name: String,
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub reasoning_text: String,
    /// Route the persona or attack expected the target to take.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_route: Option<String>,
    /// Whether the judged response asserted that data was found.
    #[serde(default)]
    pub claims_data_found: bool,
}

impl EvaluationOutcome {
    /// A failing outcome with no extra context.
    pub fn failing(
        turn_reference: impl Into<String>,
        metric_name: impl Into<String>,
        score: f64,
        threshold: f64,
        reasoning_text: impl Into<String>,
    ) -> Self {
        Self {
            turn_reference: turn_reference.into(),
            metric_name: metric_name.into(),
            score,
            threshold,
            passed: false,
            reasoning_text: reasoning_text.into(),
            expected_route: None,
            claims_data_found: false,
        }
    }

    pub fn with_expected_route(mut self, route: impl Into<String>) -> Self {
        self.expected_route = Some(route.into());
        self
    }

    pub fn with_data_claim(mut self, claims: bool) -> Self {
        self.claims_data_found = claims;
        self
    }

    /// Whether the metric judges response quality (completeness, coherence...).
    pub fn is_response_quality_failure(&self) -> bool {
        if self.passed {
            return false;
        }
        let name = self.metric_name.to_ascii_lowercase();
        RESPONSE_QUALITY_METRICS.iter().any(|m| name.contains(m))
    }
}

/// Normalize one judge payload into an `EvaluationOutcome`.
///
/// Unrecognized shapes map to documented defaults: metric
/// `"unknown_metric"`, score 0.0, threshold 0.5, pass decided by
/// `score >= threshold` unless an explicit flag is present.
pub fn coerce_outcome(turn_reference: impl Into<String>, value: &Value) -> EvaluationOutcome {
    let turn_reference = turn_reference.into();
    let Some(object) = value.as_object() else {
        return EvaluationOutcome {
            turn_reference,
            metric_name: DEFAULT_METRIC_NAME.to_string(),
            score: 0.0,
            threshold: DEFAULT_THRESHOLD,
            passed: false,
            reasoning_text: String::new(),
            expected_route: None,
            claims_data_found: false,
        };
    };
    let context = object.get("context").and_then(Value::as_object);

    let metric_name = first_str(object, &["metric_name", "metric", "name"])
        .unwrap_or(DEFAULT_METRIC_NAME)
        .to_string();

    let score = ["score", "value"]
        .iter()
        .find_map(|k| object.get(*k).and_then(coerce_score))
        .unwrap_or(0.0);

    let threshold = object
        .get("threshold")
        .and_then(value_as_f64)
        .unwrap_or(DEFAULT_THRESHOLD);

    let passed = ["passed", "success"]
        .iter()
        .find_map(|k| object.get(*k).filter(|v| !v.is_null()).map(value_is_truthy))
        .unwrap_or(score >= threshold);

    let reasoning_text = first_str(object, &["reasoning", "reason", "explanation"])
        .unwrap_or_default()
        .to_string();

    let route_keys = ["expected_route", "expected_agent", "expected_handler"];
    let expected_route = first_str(object, &route_keys)
        .or_else(|| context.and_then(|c| first_str(c, &route_keys)))
        .map(str::to_string);

    let explicit_claim = object
        .get("claims_data_found")
        .or_else(|| context.and_then(|c| c.get("claims_data_found")))
        .filter(|v| !v.is_null())
        .map(value_is_truthy);
    let claims_data_found = explicit_claim.unwrap_or_else(|| {
        let reasoning = reasoning_text.to_ascii_lowercase();
        DATA_CLAIM_PHRASES.iter().any(|p| reasoning.contains(p))
    });

    EvaluationOutcome {
        turn_reference,
        metric_name,
        score,
        threshold,
        passed,
        reasoning_text,
        expected_route,
        claims_data_found,
    }
}

fn first_str<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| object.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

fn coerce_score(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Object(inner) => ["value", "score"]
            .iter()
            .find_map(|k| inner.get(*k).and_then(coerce_score)),
        other => value_as_f64(other),
    }
}
