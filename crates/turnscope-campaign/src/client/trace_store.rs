//! Tracing store client and trace id helpers
//!
//! Trace ids follow the X-Ray format `1-<8 hex epoch seconds>-<24 hex>`.

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::OnceLock;
use turnscope_trace::RawSegment;

use super::{server_error, ClientError, HttpClientConfig, TraceStore};

const TRACE_ID_PATTERN: &str = r"^1-[0-9a-f]{8}-[0-9a-f]{24}$";

fn trace_id_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(TRACE_ID_PATTERN).ok()).as_ref()
}

/// Reject ids the tracing backend would not accept
pub fn validate_trace_id(trace_id: &str) -> Result<(), ClientError> {
    match trace_id_regex() {
        Some(pattern) if pattern.is_match(trace_id) => Ok(()),
        _ => Err(ClientError::InvalidTraceId(trace_id.to_string())),
    }
}

/// Fresh id for the propagation header
pub fn generate_trace_id() -> String {
    let epoch = chrono::Utc::now().timestamp().max(0) as u64 & 0xffff_ffff;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("1-{:08x}-{}", epoch, &random[..24])
}

/// Fetches raw segments from `GET {base_url}/traces/{trace_id}`
pub struct HttpTraceStore {
    base_url: String,
    client: Client,
}

impl HttpTraceStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_config(base_url, HttpClientConfig::default())
    }

    pub fn with_config(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: config.build_client()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TraceStore for HttpTraceStore {
    async fn fetch_trace(&self, trace_id: &str) -> Result<Option<Vec<RawSegment>>, ClientError> {
        validate_trace_id(trace_id)?;
        let url = format!("{}/traces/{}", self.base_url, trace_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        let segments = parse_segments(&body)?;
        Ok((!segments.is_empty()).then_some(segments))
    }
}

/// Accepts a bare array, `{segments}`/`{Segments}`, or the X-Ray
/// `{Traces: [{Segments}]}` batch shape. Elements are documents or
/// `{Document: "<json>"}` wrappers.
pub fn parse_segments(body: &Value) -> Result<Vec<RawSegment>, ClientError> {
    let elements: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(object) => {
            if let Some(items) = ["segments", "Segments"]
                .iter()
                .find_map(|k| object.get(*k).and_then(Value::as_array))
            {
                items.iter().collect()
            } else if let Some(traces) = object.get("Traces").and_then(Value::as_array) {
                traces
                    .iter()
                    .filter_map(|t| t.get("Segments").and_then(Value::as_array))
                    .flatten()
                    .collect()
            } else {
                return Err(ClientError::Parse(
                    "trace body has no segment list".to_string(),
                ));
            }
        }
        _ => {
            return Err(ClientError::Parse(
                "trace body is neither an array nor an object".to_string(),
            ))
        }
    };

    Ok(elements
        .into_iter()
        .map(|element| match element.get("Document") {
            Some(document) => RawSegment::new(document.clone()),
            None => RawSegment::new(element.clone()),
        })
        .collect())
}
