//! Error types for campaign orchestration
//!
//! Only configuration problems and storage failures during state transitions
//! reach the caller. Failures local to one turn or one trace fetch are
//! recorded on the turn instead.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::telemetry::TelemetryError;

/// Main error type for orchestrator operations
#[derive(Error, Debug, Clone)]
pub enum CampaignError {
    /// Campaign or engine configuration rejected at creation time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Campaign not found: {0}")]
    NotFound(Uuid),

    /// Requested state change is not allowed from the current status
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Process-wide campaign limit reached
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CampaignError {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        CampaignError::InvalidConfig(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        CampaignError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        CampaignError::Internal(msg.into())
    }

    /// Check if this is a caller mistake (vs an infrastructure failure)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CampaignError::InvalidConfig(_)
                | CampaignError::NotFound(_)
                | CampaignError::InvalidTransition { .. }
        )
    }
}

impl From<TelemetryError> for CampaignError {
    fn from(err: TelemetryError) -> Self {
        CampaignError::Internal(format!("telemetry: {}", err))
    }
}

impl From<std::io::Error> for CampaignError {
    fn from(err: std::io::Error) -> Self {
        CampaignError::InvalidConfig(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for CampaignError {
    fn from(err: serde_json::Error) -> Self {
        CampaignError::InvalidConfig(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for CampaignError {
    fn from(err: serde_yaml::Error) -> Self {
        CampaignError::InvalidConfig(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for CampaignError {
    fn from(err: toml::de::Error) -> Self {
        CampaignError::InvalidConfig(format!("TOML error: {}", err))
    }
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, CampaignError>;
