//! Engine configuration
//!
//! `EngineConfig` holds the process-wide options of the orchestrator and the
//! turn executor. It is loaded once, validated, and passed explicitly into the
//! components that need it. `Snapshot` provides the atomic swap used for hot
//! reload of immutable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use turnscope_trace::CorrelationConfig;

use crate::contracts::CampaignConfig;
use crate::error::{CampaignError, Result};

/// Process-wide engine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission limit for concurrently running campaigns
    pub max_concurrent_campaigns: usize,

    /// Turn budget for campaigns that do not set one
    pub default_max_turns: u32,

    pub default_max_concurrent_turns: usize,

    /// Per-turn timeout for the target exchange
    pub turn_timeout_seconds: u64,

    pub campaign_timeout_minutes: u64,

    /// Minimum confidence for a correlation to be reported as primary
    pub root_cause_confidence_threshold: f64,

    pub trace_fetch_max_attempts: u32,
    pub trace_fetch_initial_backoff_ms: u64,
    pub trace_fetch_max_backoff_ms: u64,
    pub trace_fetch_backoff_multiplier: f64,

    /// Retries after the first target attempt on transient failures
    pub target_max_retries: u32,
    pub target_retry_backoff_ms: u64,

    /// Analyzed traces kept for reuse
    pub trace_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_campaigns: 100,
            default_max_turns: 10,
            default_max_concurrent_turns: 3,
            turn_timeout_seconds: 30,
            campaign_timeout_minutes: 60,
            root_cause_confidence_threshold: 0.7,
            trace_fetch_max_attempts: 5,
            trace_fetch_initial_backoff_ms: 500,
            trace_fetch_max_backoff_ms: 8000,
            trace_fetch_backoff_multiplier: 2.0,
            target_max_retries: 1,
            target_retry_backoff_ms: 250,
            trace_cache_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Create a new config builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Create config from `TURNSCOPE_*` environment variables
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_campaigns: env_or(
                "TURNSCOPE_MAX_CONCURRENT_CAMPAIGNS",
                defaults.max_concurrent_campaigns,
            ),
            default_max_turns: env_or("TURNSCOPE_MAX_TURNS", defaults.default_max_turns),
            default_max_concurrent_turns: env_or(
                "TURNSCOPE_MAX_CONCURRENT_TURNS",
                defaults.default_max_concurrent_turns,
            ),
            turn_timeout_seconds: env_or(
                "TURNSCOPE_TURN_TIMEOUT_SECONDS",
                defaults.turn_timeout_seconds,
            ),
            campaign_timeout_minutes: env_or(
                "TURNSCOPE_CAMPAIGN_TIMEOUT_MINUTES",
                defaults.campaign_timeout_minutes,
            ),
            root_cause_confidence_threshold: env_or(
                "TURNSCOPE_ROOT_CAUSE_CONFIDENCE_THRESHOLD",
                defaults.root_cause_confidence_threshold,
            ),
            trace_fetch_max_attempts: env_or(
                "TURNSCOPE_TRACE_FETCH_MAX_ATTEMPTS",
                defaults.trace_fetch_max_attempts,
            ),
            trace_fetch_initial_backoff_ms: env_or(
                "TURNSCOPE_TRACE_FETCH_INITIAL_BACKOFF_MS",
                defaults.trace_fetch_initial_backoff_ms,
            ),
            trace_fetch_max_backoff_ms: env_or(
                "TURNSCOPE_TRACE_FETCH_MAX_BACKOFF_MS",
                defaults.trace_fetch_max_backoff_ms,
            ),
            trace_fetch_backoff_multiplier: env_or(
                "TURNSCOPE_TRACE_FETCH_BACKOFF_MULTIPLIER",
                defaults.trace_fetch_backoff_multiplier,
            ),
            target_max_retries: env_or("TURNSCOPE_TARGET_MAX_RETRIES", defaults.target_max_retries),
            target_retry_backoff_ms: env_or(
                "TURNSCOPE_TARGET_RETRY_BACKOFF_MS",
                defaults.target_retry_backoff_ms,
            ),
            trace_cache_capacity: env_or(
                "TURNSCOPE_TRACE_CACHE_CAPACITY",
                defaults.trace_cache_capacity,
            ),
        }
    }

    /// Load config from a file: YAML for `.yaml`/`.yml`, TOML for `.toml`,
    /// JSON otherwise. Missing fields keep their default.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let config: Self = match extension.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_campaigns == 0 {
            return Err(CampaignError::invalid_config(
                "max_concurrent_campaigns must be at least 1",
            ));
        }
        if self.default_max_turns == 0 || self.default_max_concurrent_turns == 0 {
            return Err(CampaignError::invalid_config(
                "default turn limits must be at least 1",
            ));
        }
        if self.turn_timeout_seconds == 0 || self.campaign_timeout_minutes == 0 {
            return Err(CampaignError::invalid_config("timeouts must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.root_cause_confidence_threshold) {
            return Err(CampaignError::invalid_config(format!(
                "root_cause_confidence_threshold must be within [0, 1], got {}",
                self.root_cause_confidence_threshold
            )));
        }
        if self.trace_fetch_max_attempts == 0 {
            return Err(CampaignError::invalid_config(
                "trace_fetch_max_attempts must be at least 1",
            ));
        }
        if self.trace_fetch_backoff_multiplier < 1.0 {
            return Err(CampaignError::invalid_config(
                "trace_fetch_backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Campaign limits applied when a request carries none
    pub fn default_campaign_config(&self) -> CampaignConfig {
        CampaignConfig {
            max_turns: self.default_max_turns,
            max_concurrent_turns: self.default_max_concurrent_turns,
            turn_timeout_seconds: self.turn_timeout_seconds,
        }
    }

    /// Correlation heuristics seeded with the configured reporting threshold
    pub fn correlation_config(&self) -> CorrelationConfig {
        CorrelationConfig::builder()
            .reporting_threshold(self.root_cause_confidence_threshold)
            .build()
    }

    pub fn campaign_timeout(&self) -> Duration {
        Duration::from_secs(self.campaign_timeout_minutes.saturating_mul(60))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_concurrent_campaigns(mut self, max: usize) -> Self {
        self.config.max_concurrent_campaigns = max;
        self
    }

    pub fn default_max_turns(mut self, max: u32) -> Self {
        self.config.default_max_turns = max;
        self
    }

    pub fn default_max_concurrent_turns(mut self, max: usize) -> Self {
        self.config.default_max_concurrent_turns = max;
        self
    }

    pub fn turn_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.turn_timeout_seconds = seconds;
        self
    }

    pub fn campaign_timeout_minutes(mut self, minutes: u64) -> Self {
        self.config.campaign_timeout_minutes = minutes;
        self
    }

    pub fn root_cause_confidence_threshold(mut self, threshold: f64) -> Self {
        self.config.root_cause_confidence_threshold = threshold;
        self
    }

    /// Set the trace fetch retry policy
    pub fn trace_fetch_retry(mut self, max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.config.trace_fetch_max_attempts = max_attempts;
        self.config.trace_fetch_initial_backoff_ms = initial_backoff_ms;
        self.config.trace_fetch_max_backoff_ms = max_backoff_ms;
        self
    }

    pub fn trace_fetch_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.trace_fetch_backoff_multiplier = multiplier;
        self
    }

    /// Set the target retry policy
    pub fn target_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.config.target_max_retries = max_retries;
        self.config.target_retry_backoff_ms = backoff_ms;
        self
    }

    pub fn trace_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.trace_cache_capacity = capacity;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable value that can be replaced atomically.
///
/// Readers get an `Arc` to the snapshot current at the time of the call and
/// keep it for as long as they need; `store` never mutates a published value.
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish a new snapshot
    pub fn store(&self, value: T) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(value);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Snapshot").field(&self.load()).finish()
    }
}
