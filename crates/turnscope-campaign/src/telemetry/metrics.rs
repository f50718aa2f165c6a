//! Prometheus metrics for campaign execution
//!
//! - `turnscope_turns_total` (counter) - Terminal turns by campaign kind and status
//! - `turnscope_turn_duration_seconds` (histogram) - Turn wall time by campaign kind
//! - `turnscope_turns_in_flight` (gauge) - Turns currently executing
//! - `turnscope_campaigns_active` (gauge) - Campaigns holding an admission permit
//! - `turnscope_trace_fetch_attempts_total` (counter) - Trace store calls by result
//! - `turnscope_root_causes_total` (counter) - Primary root causes by correlation type
//! - `turnscope_root_cause_confidence` (histogram) - Primary root cause confidence
//!
//! # Example
//!
//! ```rust,no_run
//! use turnscope_campaign::telemetry::CampaignMetricsRegistry;
//!
//! let registry = CampaignMetricsRegistry::new().unwrap();
//! let metrics = registry.campaign();
//! metrics.record_trace_fetch("found");
//! println!("{}", registry.encode_text().unwrap());
//! ```

use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;

use super::{Result, TelemetryError};

const NAMESPACE: &str = "turnscope";

/// Campaign metrics for Prometheus
pub struct CampaignMetrics {
    turns_total: CounterVec,
    turn_duration_seconds: HistogramVec,
    turns_in_flight: Gauge,
    campaigns_active: Gauge,
    trace_fetch_attempts_total: CounterVec,
    root_causes_total: CounterVec,
    root_cause_confidence: Histogram,
}

impl CampaignMetrics {
    /// Create the metrics and register them with the provided registry
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let turns_total = CounterVec::new(
            Opts::new("turns_total", "Total number of turns that reached a terminal status")
                .namespace(NAMESPACE),
            &["campaign_kind", "status"],
        )?;

        let turn_duration_seconds = HistogramVec::new(
            HistogramOpts::new("turn_duration_seconds", "Turn execution time in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["campaign_kind"],
        )?;

        let turns_in_flight = Gauge::with_opts(
            Opts::new("turns_in_flight", "Number of turns currently executing").namespace(NAMESPACE),
        )?;

        let campaigns_active = Gauge::with_opts(
            Opts::new("campaigns_active", "Number of campaigns currently running")
                .namespace(NAMESPACE),
        )?;

        let trace_fetch_attempts_total = CounterVec::new(
            Opts::new("trace_fetch_attempts_total", "Trace store fetch attempts by result")
                .namespace(NAMESPACE),
            &["result"],
        )?;

        let root_causes_total = CounterVec::new(
            Opts::new("root_causes_total", "Primary root causes by correlation type")
                .namespace(NAMESPACE),
            &["correlation_type"],
        )?;

        let root_cause_confidence = Histogram::with_opts(
            HistogramOpts::new("root_cause_confidence", "Confidence of primary root causes")
                .namespace(NAMESPACE)
                .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        )?;

        registry.register(Box::new(turns_total.clone()))?;
        registry.register(Box::new(turn_duration_seconds.clone()))?;
        registry.register(Box::new(turns_in_flight.clone()))?;
        registry.register(Box::new(campaigns_active.clone()))?;
        registry.register(Box::new(trace_fetch_attempts_total.clone()))?;
        registry.register(Box::new(root_causes_total.clone()))?;
        registry.register(Box::new(root_cause_confidence.clone()))?;

        Ok(Self {
            turns_total,
            turn_duration_seconds,
            turns_in_flight,
            campaigns_active,
            trace_fetch_attempts_total,
            root_causes_total,
            root_cause_confidence,
        })
    }

    /// Record a turn reaching a terminal status
    pub fn record_turn(&self, campaign_kind: &str, status: &str) {
        self.turns_total
            .with_label_values(&[campaign_kind, status])
            .inc();
    }

    pub fn observe_turn_duration(&self, campaign_kind: &str, duration_secs: f64) {
        self.turn_duration_seconds
            .with_label_values(&[campaign_kind])
            .observe(duration_secs);
    }

    pub fn inc_campaigns_active(&self) {
        self.campaigns_active.inc();
    }

    pub fn dec_campaigns_active(&self) {
        self.campaigns_active.dec();
    }

    /// `found`, `not_found` or `error`
    pub fn record_trace_fetch(&self, result: &str) {
        self.trace_fetch_attempts_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn record_root_cause(&self, correlation_type: &str, confidence: f64) {
        self.root_causes_total
            .with_label_values(&[correlation_type])
            .inc();
        self.root_cause_confidence.observe(confidence);
    }

    /// Start a turn timer (records duration and in-flight count on drop)
    pub fn start_turn(&self, campaign_kind: &str) -> TurnTimer<'_> {
        self.turns_in_flight.inc();
        TurnTimer {
            start: Instant::now(),
            campaign_kind: campaign_kind.to_string(),
            metrics: self,
        }
    }

    pub fn turns_in_flight(&self) -> f64 {
        self.turns_in_flight.get()
    }

    pub fn campaigns_active(&self) -> f64 {
        self.campaigns_active.get()
    }
}

/// RAII guard for timing turns
pub struct TurnTimer<'a> {
    start: Instant,
    campaign_kind: String,
    metrics: &'a CampaignMetrics,
}

impl<'a> TurnTimer<'a> {
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl<'a> Drop for TurnTimer<'a> {
    fn drop(&mut self) {
        self.metrics
            .observe_turn_duration(&self.campaign_kind, self.start.elapsed().as_secs_f64());
        self.metrics.turns_in_flight.dec();
    }
}

/// Registry owning all campaign metrics
pub struct CampaignMetricsRegistry {
    registry: Arc<Registry>,
    campaign: CampaignMetrics,
}

impl CampaignMetricsRegistry {
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create with an existing Prometheus registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let campaign = CampaignMetrics::new(Arc::clone(&registry))?;
        Ok(Self { registry, campaign })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn campaign(&self) -> &CampaignMetrics {
        &self.campaign
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode metrics as text for scraping
    pub fn encode_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::EncodingError(e.to_string()))
    }
}
