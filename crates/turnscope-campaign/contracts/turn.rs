//! Turn records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use turnscope_trace::{EvaluationOutcome, RootCause};
use uuid::Uuid;

use crate::error::{CampaignError, Result};

/// Turn lifecycle: `pending -> running -> {completed, failed, timed_out}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Running => "running",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
            TurnStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Completed | TurnStatus::Failed | TurnStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request/response exchange within a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub campaign_id: Uuid,
    /// 1-based, strictly increasing in scheduling order
    pub turn_number: u32,
    pub status: TurnStatus,
    pub user_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_response: Option<String>,
    /// Absent when the target never echoed one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub evaluations: Vec<EvaluationOutcome>,
    /// One per failing metric
    #[serde(default)]
    pub root_causes: Vec<RootCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Turn {
    pub fn pending(campaign_id: Uuid, turn_number: u32, user_message: impl Into<String>) -> Self {
        Self {
            campaign_id,
            turn_number,
            status: TurnStatus::Pending,
            user_message: user_message.into(),
            system_response: None,
            trace_id: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            evaluations: Vec::new(),
            root_causes: Vec::new(),
            error: None,
        }
    }

    /// Reference string handed to the judge and the correlation engine
    pub fn reference(&self) -> String {
        format!("{}:{}", self.campaign_id, self.turn_number)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TurnStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Every metric passed
    pub fn complete(&mut self, evaluations: Vec<EvaluationOutcome>) -> Result<()> {
        self.transition(TurnStatus::Completed)?;
        self.evaluations = evaluations;
        Ok(())
    }

    /// At least one metric failed; `root_causes` holds one diagnosis per failure
    pub fn fail_evaluation(
        &mut self,
        evaluations: Vec<EvaluationOutcome>,
        root_causes: Vec<RootCause>,
    ) -> Result<()> {
        self.transition(TurnStatus::Failed)?;
        self.evaluations = evaluations;
        self.root_causes = root_causes;
        Ok(())
    }

    /// Target or judge failure
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TurnStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn time_out(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TurnStatus::TimedOut)?;
        self.error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, next: TurnStatus) -> Result<()> {
        let allowed = match self.status {
            TurnStatus::Pending => next == TurnStatus::Running,
            TurnStatus::Running => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(CampaignError::invalid_transition(self.status, next));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
