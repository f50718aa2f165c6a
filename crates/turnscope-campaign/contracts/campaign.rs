//! Campaign records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use turnscope_trace::{CorrelationType, RootCause};
use uuid::Uuid;

use super::turn::{Turn, TurnStatus};
use crate::error::{CampaignError, Result};

/// What a campaign exercises on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    Persona,
    RedTeam,
    Combined,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Persona => "persona",
            CampaignKind::RedTeam => "red_team",
            CampaignKind::Combined => "combined",
        }
    }

    pub fn requires_persona(&self) -> bool {
        matches!(self, CampaignKind::Persona | CampaignKind::Combined)
    }

    pub fn requires_attack(&self) -> bool {
        matches!(self, CampaignKind::RedTeam | CampaignKind::Combined)
    }
}

impl std::fmt::Display for CampaignKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignKind {
    type Err = CampaignError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "persona" => Ok(CampaignKind::Persona),
            "red_team" | "redteam" => Ok(CampaignKind::RedTeam),
            "combined" => Ok(CampaignKind::Combined),
            other => Err(CampaignError::invalid_config(format!(
                "unknown campaign kind '{}'",
                other
            ))),
        }
    }
}

/// Campaign lifecycle: `created -> running -> {paused, completed, failed}`,
/// with `paused -> running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Created => "created",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-campaign execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub max_turns: u32,
    pub max_concurrent_turns: usize,
    pub turn_timeout_seconds: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_concurrent_turns: 3,
            turn_timeout_seconds: 30,
        }
    }
}

impl CampaignConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(CampaignError::invalid_config("max_turns must be at least 1"));
        }
        if self.max_concurrent_turns == 0 {
            return Err(CampaignError::invalid_config(
                "max_concurrent_turns must be at least 1",
            ));
        }
        if self.turn_timeout_seconds == 0 {
            return Err(CampaignError::invalid_config(
                "turn_timeout_seconds must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Aggregated turn counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    /// Turns scheduled so far
    pub turns_total: u32,
    pub turns_completed: u32,
    /// Failed turns, timed out turns included
    pub turns_failed: u32,
    pub turns_timed_out: u32,
    /// Primary correlation type counts over diagnosed turns
    #[serde(default)]
    pub root_causes_by_type: BTreeMap<CorrelationType, u32>,
}

impl CampaignStats {
    /// Fold one terminal turn into the counters.
    pub fn record(&mut self, turn: &Turn) {
        match turn.status {
            TurnStatus::Completed => self.turns_completed += 1,
            TurnStatus::Failed => self.turns_failed += 1,
            TurnStatus::TimedOut => {
                self.turns_failed += 1;
                self.turns_timed_out += 1;
            }
            TurnStatus::Pending | TurnStatus::Running => return,
        }
        for root_cause in &turn.root_causes {
            *self
                .root_causes_by_type
                .entry(root_cause.primary.correlation_type)
                .or_insert(0) += 1;
        }
    }

    /// Turns that reached a terminal status
    pub fn turns_finished(&self) -> u32 {
        self.turns_completed + self.turns_failed
    }
}

/// Input for `create_campaign`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: CampaignKind,
    pub target_url: String,
    #[serde(default)]
    pub persona_type: Option<String>,
    #[serde(default)]
    pub attack_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Falls back to the engine defaults when absent
    #[serde(default)]
    pub config: Option<CampaignConfig>,
    /// User messages sent turn after turn, cycling
    #[serde(default)]
    pub messages: Vec<String>,
    /// Stop scheduling after this many failed turns
    #[serde(default)]
    pub stop_after_failures: Option<u32>,
}

impl CampaignRequest {
    pub fn new(kind: CampaignKind, target_url: impl Into<String>) -> Self {
        Self {
            name: None,
            kind,
            target_url: target_url.into(),
            persona_type: None,
            attack_type: None,
            session_id: None,
            config: None,
            messages: Vec::new(),
            stop_after_failures: None,
        }
    }

    pub fn with_persona(mut self, persona_type: impl Into<String>) -> Self {
        self.persona_type = Some(persona_type.into());
        self
    }

    pub fn with_attack(mut self, attack_type: impl Into<String>) -> Self {
        self.attack_type = Some(attack_type.into());
        self
    }

    pub fn with_config(mut self, config: CampaignConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_messages<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.messages = messages.into_iter().map(Into::into).collect();
        self
    }

    /// Reject requests that would produce a campaign unable to run.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.target_url).map_err(|e| {
            CampaignError::invalid_config(format!("target_url '{}': {}", self.target_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CampaignError::invalid_config(format!(
                "target_url must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if self.kind.requires_persona() && is_blank(&self.persona_type) {
            return Err(CampaignError::invalid_config(format!(
                "persona_type is required for {} campaigns",
                self.kind
            )));
        }
        if self.kind.requires_attack() && is_blank(&self.attack_type) {
            return Err(CampaignError::invalid_config(format!(
                "attack_type is required for {} campaigns",
                self.kind
            )));
        }
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// One evaluation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub kind: CampaignKind,
    pub target_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<String>,
    pub session_id: String,
    pub status: CampaignStatus,
    pub config: CampaignConfig,
    pub stats: CampaignStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Build a `created` campaign from a validated request.
    pub fn from_request(request: &CampaignRequest, config: CampaignConfig) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", request.kind, &id.simple().to_string()[..8])),
            kind: request.kind,
            target_url: request.target_url.clone(),
            persona_type: request.persona_type.clone(),
            attack_type: request.attack_type.clone(),
            session_id: request
                .session_id
                .clone()
                .unwrap_or_else(|| format!("session-{}", id.simple())),
            status: CampaignStatus::Created,
            config,
            stats: CampaignStats::default(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping the lifecycle timestamps.
    pub fn transition(&mut self, next: CampaignStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CampaignError::invalid_transition(self.status, next));
        }
        let now = Utc::now();
        if next == CampaignStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// End the campaign `failed` with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(CampaignStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

/// Diagnosis attached to one turn, for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRootCause {
    pub turn_number: u32,
    pub root_cause: RootCause,
}

/// Campaign-level aggregates exposed for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign: Campaign,
    pub stats: CampaignStats,
    /// Ordered by turn number
    pub root_causes: Vec<TurnRootCause>,
    /// Failed or timed-out turns lacking any trace-backed cause, including
    /// turns that never reached the judge
    pub insufficient_evidence_turns: Vec<u32>,
}

impl CampaignReport {
    pub fn build(campaign: Campaign, turns: &[Turn]) -> Self {
        let mut ordered: Vec<&Turn> = turns.iter().collect();
        ordered.sort_by_key(|t| t.turn_number);

        let root_causes = ordered
            .iter()
            .flat_map(|turn| {
                turn.root_causes.iter().map(move |rc| TurnRootCause {
                    turn_number: turn.turn_number,
                    root_cause: rc.clone(),
                })
            })
            .collect();
        let insufficient_evidence_turns = ordered
            .iter()
            .filter(|t| matches!(t.status, TurnStatus::Failed | TurnStatus::TimedOut))
            .filter(|t| t.root_causes.iter().all(RootCause::insufficient_evidence))
            .map(|t| t.turn_number)
            .collect();

        Self {
            stats: campaign.stats.clone(),
            campaign,
            root_causes,
            insufficient_evidence_turns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CampaignRequest {
        CampaignRequest::new(CampaignKind::Persona, "http://localhost:9000/chat")
            .with_persona("frustrated_customer")
    }

    #[test]
    fn test_status_transitions() {
        use CampaignStatus::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Created.can_transition_to(Completed));
    }

    #[test]
    fn test_campaign_transition_stamps_timestamps() {
        let mut campaign = Campaign::from_request(&request(), CampaignConfig::default());
        assert_eq!(campaign.status, CampaignStatus::Created);
        campaign.transition(CampaignStatus::Running).unwrap();
        assert!(campaign.started_at.is_some());
        campaign.transition(CampaignStatus::Completed).unwrap();
        assert!(campaign.completed_at.is_some());

        let err = campaign.transition(CampaignStatus::Running).unwrap_err();
        assert!(matches!(err, CampaignError::InvalidTransition { .. }));
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let missing_persona = CampaignRequest::new(CampaignKind::Combined, "http://t/chat")
            .with_attack("prompt_injection");
        assert!(missing_persona.validate().is_err());

        let bad_url = CampaignRequest::new(CampaignKind::RedTeam, "ftp://t").with_attack("jailbreak");
        assert!(bad_url.validate().is_err());

        let zero_turns = request().with_config(CampaignConfig {
            max_turns: 0,
            ..CampaignConfig::default()
        });
        assert!(zero_turns.validate().is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("red-team".parse::<CampaignKind>().unwrap(), CampaignKind::RedTeam);
        assert_eq!("Combined".parse::<CampaignKind>().unwrap(), CampaignKind::Combined);
        assert!("chaos".parse::<CampaignKind>().is_err());
    }

    #[test]
    fn test_stats_record() {
        let id = Uuid::new_v4();
        let mut stats = CampaignStats::default();

        let mut done = Turn::pending(id, 1, "hi");
        done.start().unwrap();
        done.complete(Vec::new()).unwrap();
        stats.record(&done);

        let mut slow = Turn::pending(id, 2, "hi");
        slow.start().unwrap();
        slow.time_out("turn exceeded 30s").unwrap();
        stats.record(&slow);

        assert_eq!(stats.turns_completed, 1);
        assert_eq!(stats.turns_failed, 1);
        assert_eq!(stats.turns_timed_out, 1);
        assert_eq!(stats.turns_finished(), 2);
    }

    #[test]
    fn test_report_marks_every_undiagnosed_failure() {
        use serde_json::json;
        use turnscope_trace::{analyze, correlate, CorrelationConfig, EvaluationOutcome, RawSegment, TraceAnalysis};

        let campaign = Campaign::from_request(&request(), CampaignConfig::default());
        let config = CorrelationConfig::default();
        let failing = EvaluationOutcome::failing("c:1", "completeness", 0.1, 0.7, "cut off");
        let truncated = analyze(
            "t",
            &[RawSegment::new(json!({
                "id": "llm", "name": "bedrock", "start_time": 0.0, "end_time": 1.0,
                "annotations": {"model_id": "claude", "completion_tokens": 256, "max_tokens": 256}
            }))],
        )
        .unwrap();

        let started = |n: u32| {
            let mut turn = Turn::pending(campaign.id, n, "hi");
            turn.start().unwrap();
            turn
        };
        let mut passed = started(1);
        passed.complete(Vec::new()).unwrap();
        let mut diagnosed = started(2);
        diagnosed
            .fail_evaluation(vec![failing.clone()], vec![correlate(&failing, &truncated, &config)])
            .unwrap();
        let mut untraced = started(3);
        untraced
            .fail_evaluation(
                vec![failing.clone()],
                vec![correlate(&failing, &TraceAnalysis::empty("t"), &config)],
            )
            .unwrap();
        let mut unreachable = started(4);
        unreachable.fail("target request failed: connection refused").unwrap();
        let mut slow = started(5);
        slow.time_out("target did not answer within 30s").unwrap();

        let report = CampaignReport::build(campaign, &[slow, unreachable, untraced, diagnosed, passed]);
        assert_eq!(report.insufficient_evidence_turns, vec![3, 4, 5]);
        assert_eq!(report.root_causes.len(), 2);
        assert_eq!(report.root_causes[0].turn_number, 2);
    }
}
