use std::fmt;

use shared::domain::{CategoryId, ItemId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    Categories,
    Items(CategoryId),
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categories => write!(f, "categories"),
            Self::Items(category_id) => write!(f, "items of category {category_id}"),
        }
    }
}

/// Which half of the two-step activation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Deactivate,
    Activate,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deactivate => write!(f, "deactivate-all"),
            Self::Activate => write!(f, "activate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("speech recognition is not supported on this device")]
    Unsupported,
    #[error("no microphone is available")]
    NoMicrophone,
    #[error("speech recognition unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load {target}: {source}")]
    Fetch {
        target: FetchTarget,
        source: anyhow::Error,
    },
    #[error("{stage} write for item {item_id} failed after {attempts} attempt(s): {source}")]
    Write {
        item_id: ItemId,
        stage: WriteStage,
        attempts: u32,
        source: anyhow::Error,
    },
    #[error("change feed unavailable for category {category_id}: {source}")]
    Subscription {
        category_id: CategoryId,
        source: anyhow::Error,
    },
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("item {0} is not part of the current projection")]
    UnknownItem(ItemId),
}

impl SyncError {
    /// Fetch and subscription failures clear up by selecting the category again.
    pub fn is_retryable_by_resync(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Subscription { .. })
    }
}
