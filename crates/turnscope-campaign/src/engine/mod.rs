//! Campaign engine
//!
//! The orchestrator schedules turns under the campaign's concurrency bound;
//! each turn runs in a `TurnExecutor` and hands its terminal record back to
//! the orchestrator, which owns the campaign counters.

pub mod cache;
pub mod executor;
pub mod orchestrator;

pub use cache::TraceCache;
pub use executor::{RetryPolicy, TurnContext, TurnExecutor};
pub use orchestrator::{CampaignOrchestrator, OrchestratorBuilder};

use crate::contracts::CampaignStats;

/// Supplies the user message for each scheduled turn
pub trait MessageSource: Send {
    /// Message for `turn_number`, or `None` when the source is exhausted
    fn next_message(&mut self, turn_number: u32) -> Option<String>;
}

/// Cycles through a fixed list of messages
#[derive(Debug, Clone, Default)]
pub struct ScriptedMessages {
    messages: Vec<String>,
}

impl ScriptedMessages {
    pub fn new<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            messages: messages.into_iter().map(Into::into).collect(),
        }
    }
}

impl MessageSource for ScriptedMessages {
    fn next_message(&mut self, turn_number: u32) -> Option<String> {
        if self.messages.is_empty() || turn_number == 0 {
            return None;
        }
        let index = (turn_number as usize - 1) % self.messages.len();
        self.messages.get(index).cloned()
    }
}

/// Early-stop rule checked before each turn is scheduled
pub trait StopCondition: Send + Sync {
    fn should_stop(&self, stats: &CampaignStats) -> bool;
}

/// Run the whole turn budget
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopCondition for NeverStop {
    fn should_stop(&self, _stats: &CampaignStats) -> bool {
        false
    }
}

/// Stop scheduling once this many turns have failed
#[derive(Debug, Clone, Copy)]
pub struct StopOnFailures(pub u32);

impl StopCondition for StopOnFailures {
    fn should_stop(&self, stats: &CampaignStats) -> bool {
        stats.turns_failed >= self.0
    }
}
