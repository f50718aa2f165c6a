//! Storage collaborator
//!
//! The orchestrator persists every campaign and turn transition through a
//! `CampaignStore`. `MemoryStore` is the in-process implementation.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::{Campaign, Turn};

/// Errors that can occur when talking to the storage backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Backend unavailable or rejected the write
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence for campaign and turn records
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn save_campaign(&self, campaign: &Campaign) -> StoreResult<()>;

    async fn load_campaign(&self, id: Uuid) -> StoreResult<Campaign>;

    async fn save_turn(&self, turn: &Turn) -> StoreResult<()>;

    async fn load_turn(&self, campaign_id: Uuid, turn_number: u32) -> StoreResult<Turn>;

    /// Every turn of a campaign, ordered by turn number
    async fn list_turns(&self, campaign_id: Uuid) -> StoreResult<Vec<Turn>>;
}
