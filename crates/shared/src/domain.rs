use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(CategoryId);
id_newtype!(ItemId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
}

/// One navigable text entry. `revision` is bumped by the store on every write
/// to the row and is the only field used to order competing versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub category_id: CategoryId,
    pub text: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Display order within a category: creation time, then id.
    pub fn display_order(&self, other: &Item) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// True when `self` carries a newer write than `other` for the same row.
    pub fn supersedes(&self, other: &Item) -> bool {
        self.revision > other.revision
    }
}
