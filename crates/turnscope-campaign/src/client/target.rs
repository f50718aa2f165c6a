//! HTTP client for the system under evaluation

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{server_error, ClientError, HttpClientConfig, TargetClient, TargetReply, TargetRequest, TRACE_HEADER};

/// Body fields searched, in order, for the reply text
const REPLY_FIELDS: &[&str] = &["response", "reply", "message", "text", "content", "output", "answer"];

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Posts each user message to the campaign's `target_url`
pub struct HttpTargetClient {
    client: Client,
}

impl HttpTargetClient {
    pub fn new() -> Result<Self, ClientError> {
        Self::with_config(HttpClientConfig::default())
    }

    pub fn with_config(config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            client: config.build_client()?,
        })
    }
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    async fn send(&self, request: &TargetRequest) -> Result<TargetReply, ClientError> {
        let body = ChatRequest {
            message: &request.message,
            session_id: request.session_id.as_deref(),
        };

        let response = self
            .client
            .post(&request.target_url)
            .json(&body)
            .header(TRACE_HEADER, format!("Root={};Sampled=1", request.trace_id))
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        let header_trace_id = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_trace_header);

        let text = response.text().await.map_err(ClientError::from_reqwest)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ClientError::Parse(format!("target returned non-JSON body: {}", e)))?;

        let reply = extract_reply(&value).ok_or_else(|| {
            ClientError::Parse("target response carries no reply text".to_string())
        })?;
        let body_trace_id = ["trace_id", "traceId"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(TargetReply {
            text: reply,
            trace_id: header_trace_id.or(body_trace_id),
        })
    }
}

fn extract_reply(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(object) => REPLY_FIELDS
            .iter()
            .find_map(|k| object.get(*k).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// `Root=1-...;Parent=...;Sampled=1` or a bare id
fn parse_trace_header(header: &str) -> Option<String> {
    let root = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("Root="));
    let id = match root {
        Some(root) => root,
        None if !header.contains('=') => header.trim(),
        None => return None,
    };
    (!id.is_empty()).then(|| id.to_string())
}
