use serde::{Deserialize, Serialize};

use crate::domain::{CategoryId, Item, ItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change notification for the items table. `new` is present for
/// inserts and updates, `old` for deletes (and optionally for updates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Item>,
}

impl ChangeEvent {
    pub fn inserted(item: Item) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(item),
            old: None,
        }
    }

    pub fn updated(item: Item) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(item),
            old: None,
        }
    }

    pub fn deleted(item: Item) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(item),
        }
    }

    /// The row this event talks about: `new` when present, otherwise `old`.
    pub fn row(&self) -> Option<&Item> {
        match self.event_type {
            ChangeKind::Insert | ChangeKind::Update => self.new.as_ref().or(self.old.as_ref()),
            ChangeKind::Delete => self.old.as_ref().or(self.new.as_ref()),
        }
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.row().map(|item| item.category_id)
    }

    pub fn item_id(&self) -> Option<ItemId> {
        self.row().map(|item| item.id)
    }
}

/// Table filter for change-feed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub category_id: CategoryId,
}

impl ChangeFilter {
    pub fn category(category_id: CategoryId) -> Self {
        Self { category_id }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.category_id() == Some(self.category_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}
