//! Telemetry for campaign execution
//!
//! Prometheus metrics for turns, campaigns, trace fetches and root causes.
//! Structured logs are emitted directly with `tracing` at the call sites.

pub mod metrics;

pub use metrics::{CampaignMetrics, CampaignMetricsRegistry, TurnTimer};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
