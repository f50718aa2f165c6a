//! Turnscope campaign engine
//!
//! Runs evaluation campaigns against a conversational AI system. Each turn
//! sends a persona or adversarial message to the target, has a judge score
//! the reply, and diagnoses every failing metric from the turn's trace with
//! `turnscope_trace`.
//!
//! # Design Principles
//! - Turn failures are data: they end up on the turn record, never as errors
//! - Campaign counters have a single writer, the campaign's driver task
//! - Collaborators sit behind traits so tests can replace them

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod telemetry;

// Re-export contracts
#[path = "../contracts/mod.rs"]
pub mod contracts;

pub use config::EngineConfig;
pub use contracts::*;
pub use engine::{CampaignOrchestrator, OrchestratorBuilder, TurnExecutor};
pub use error::{CampaignError, Result};
