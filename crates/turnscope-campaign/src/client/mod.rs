//! Collaborator clients
//!
//! Traits for the three external systems a turn talks to (the target under
//! evaluation, the tracing store and the judge) and their HTTP
//! implementations.

pub mod judge;
pub mod target;
pub mod trace_store;

pub use judge::{outcomes_from_body, HttpJudge};
pub use target::HttpTargetClient;
pub use trace_store::{generate_trace_id, parse_segments, validate_trace_id, HttpTraceStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use turnscope_trace::{EvaluationOutcome, RawSegment};

/// Trace propagation header understood by the target
pub const TRACE_HEADER: &str = "X-Amzn-Trace-Id";

/// Client errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid trace id: {0}")]
    InvalidTraceId(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ClientError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) => true,
            ClientError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_decode() {
            ClientError::Parse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// One message sent to the target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRequest {
    pub target_url: String,
    pub message: String,
    pub session_id: Option<String>,
    /// Propagated to the target in `X-Amzn-Trace-Id`
    pub trace_id: String,
}

/// The target's answer
#[derive(Debug, Clone, PartialEq)]
pub struct TargetReply {
    pub text: String,
    /// Trace id echoed back by the target, if any
    pub trace_id: Option<String>,
}

/// The system under evaluation
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn send(&self, request: &TargetRequest) -> Result<TargetReply, ClientError>;
}

/// Source of raw trace segments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Raw segments of a trace, `None` while the trace is not available.
    ///
    /// Malformed ids are rejected with `ClientError::InvalidTraceId` before any
    /// request is made.
    async fn fetch_trace(&self, trace_id: &str) -> Result<Option<Vec<RawSegment>>, ClientError>;
}

/// What the judge is asked to evaluate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    #[serde(skip)]
    pub turn_reference: String,
    pub user_message: String,
    pub system_response: String,
    pub context: Value,
}

/// Scores one exchange against its metrics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Vec<EvaluationOutcome>, ClientError>;
}

/// Shared settings for the HTTP collaborators
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpClientConfig {
    pub(crate) fn build_client(&self) -> Result<reqwest::Client, ClientError> {
        reqwest::Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {}", e)))
    }
}

/// Read a non-2xx response into `ClientError::Server`.
pub(crate) async fn server_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    ClientError::Server {
        status: status.as_u16(),
        message,
    }
}
