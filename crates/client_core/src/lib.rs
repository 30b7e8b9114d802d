use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Category, CategoryId, Item, ItemId},
    protocol::{ChangeEvent, ChangeFilter},
};
use tokio::sync::mpsc;

pub mod error;
pub mod navigation;
pub mod projection;
pub mod reconciler;
pub mod transport;
pub mod voice;

pub use error::{CapabilityError, FetchTarget, SyncError, WriteStage};
pub use navigation::{Direction, NavigationController};
pub use projection::{ChangeOutcome, IgnoreReason, Projection};
pub use reconciler::{Reconciler, ReconcilerEvent};
pub use transport::{HttpRemoteStore, WsChangeFeed};
pub use voice::{ListenConfig, SpeechFacility, TranscriptEvent, VoiceCommandBridge};

/// Row storage the reconciler reads from and writes to.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<Category>>;
    /// Items of one category, ordered by creation time.
    async fn fetch_items(&self, category_id: CategoryId) -> Result<Vec<Item>>;
    /// Clears the active flag across the category; returns the rows it changed.
    async fn deactivate_all(&self, category_id: CategoryId) -> Result<Vec<Item>>;
    /// Writes one row's active flag; returns the row as stored.
    async fn set_active(&self, item_id: ItemId, active: bool) -> Result<Item>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

pub struct FeedSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Source of row-level change events. Delivery is at-least-once and not
/// necessarily ordered; the events stream ends when the feed drops.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription>;
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

pub struct MissingRemoteStore;

#[async_trait]
impl RemoteStore for MissingRemoteStore {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        Err(anyhow!("remote store is unavailable"))
    }

    async fn fetch_items(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        Err(anyhow!(
            "remote store is unavailable for category {}",
            category_id.0
        ))
    }

    async fn deactivate_all(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        Err(anyhow!(
            "remote store is unavailable for category {}",
            category_id.0
        ))
    }

    async fn set_active(&self, item_id: ItemId, _active: bool) -> Result<Item> {
        Err(anyhow!("remote store is unavailable for item {}", item_id.0))
    }
}

/// Feed used when live updates are turned off; every subscription fails.
pub struct MissingChangeFeed;

#[async_trait]
impl ChangeFeed for MissingChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription> {
        Err(anyhow!(
            "change feed is unavailable for category {}",
            filter.category_id.0
        ))
    }

    async fn unsubscribe(&self, _handle: SubscriptionHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
