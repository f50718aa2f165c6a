//! In-memory campaign store

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CampaignStore, StoreError, StoreResult};
use crate::contracts::{Campaign, Turn};

/// `CampaignStore` backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<Uuid, Campaign>>,
    turns: RwLock<BTreeMap<(Uuid, u32), Turn>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn campaign_count(&self) -> usize {
        self.campaigns.read().await.len()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn save_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        self.campaigns
            .write()
            .await
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn load_campaign(&self, id: Uuid) -> StoreResult<Campaign> {
        self.campaigns
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("campaign {}", id)))
    }

    async fn save_turn(&self, turn: &Turn) -> StoreResult<()> {
        let mut turns = self.turns.write().await;
        let key = (turn.campaign_id, turn.turn_number);
        if let Some(existing) = turns.get(&key) {
            if existing.is_terminal() && existing != turn {
                return Err(StoreError::Backend(format!(
                    "turn {} of campaign {} is terminal and cannot be overwritten",
                    turn.turn_number, turn.campaign_id
                )));
            }
        }
        turns.insert(key, turn.clone());
        Ok(())
    }

    async fn load_turn(&self, campaign_id: Uuid, turn_number: u32) -> StoreResult<Turn> {
        self.turns
            .read()
            .await
            .get(&(campaign_id, turn_number))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("turn {} of campaign {}", turn_number, campaign_id))
            })
    }

    async fn list_turns(&self, campaign_id: Uuid) -> StoreResult<Vec<Turn>> {
        let turns = self.turns.read().await;
        Ok(turns
            .range((campaign_id, 0)..=(campaign_id, u32::MAX))
            .map(|(_, turn)| turn.clone())
            .collect())
    }
}
