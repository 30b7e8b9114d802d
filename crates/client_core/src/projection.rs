//! The reconciler's view of one category: its ordered items and which one is
//! active.
//!
//! Every mutation keeps the item flags consistent with `active_index`: at most
//! one item carries `active = true`, and it is the one `active_index` points
//! at. Incoming rows only replace local copies with a higher `revision`; a row
//! claiming to be active only displaces the current active item when it was
//! written no earlier than that item.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{Category, CategoryId, Item, ItemId},
    protocol::{ChangeEvent, ChangeKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoCategory,
    ForeignCategory,
    MissingRow,
    Stale,
    Deleted,
    UnknownItem,
    SupersededSubscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl ChangeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub category: Option<Category>,
    pub items: Vec<Item>,
    pub active_index: Option<usize>,
    pub settled: bool,
    /// A change-feed subscription is delivering events for `category`.
    pub live: bool,
    pub last_updated: DateTime<Utc>,
    tombstones: HashSet<ItemId>,
}

impl Default for Projection {
    fn default() -> Self {
        Self::empty()
    }
}

impl Projection {
    pub fn empty() -> Self {
        Self {
            category: None,
            items: Vec::new(),
            active_index: None,
            settled: true,
            live: false,
            last_updated: Utc::now(),
            tombstones: HashSet::new(),
        }
    }

    /// A projection for a category whose items are still loading.
    pub(crate) fn loading(category: Category) -> Self {
        Self {
            category: Some(category),
            settled: false,
            ..Self::empty()
        }
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.category.as_ref().map(|category| category.id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active_item(&self) -> Option<&Item> {
        self.active_index.and_then(|index| self.items.get(index))
    }

    pub fn position(&self, item_id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }

    /// True when the item flags and `active_index` agree and at most one
    /// item is active.
    pub fn is_consistent(&self) -> bool {
        let flagged: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.active)
            .map(|(index, _)| index)
            .collect();
        match self.active_index {
            Some(index) => flagged == [index],
            None => flagged.is_empty(),
        }
    }

    /// Replaces the item set with a fresh fetch. Rows from other categories
    /// are dropped, duplicates collapse to their newest revision, and when
    /// several rows claim to be active the most recently written one wins.
    pub(crate) fn load(&mut self, fetched: Vec<Item>) {
        let Some(category_id) = self.category_id() else {
            return;
        };

        let mut items: Vec<Item> = Vec::with_capacity(fetched.len());
        for item in fetched
            .into_iter()
            .filter(|item| item.category_id == category_id)
        {
            match items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) if item.supersedes(existing) => *existing = item,
                Some(_) => {}
                None => items.push(item),
            }
        }
        items.sort_by(|a, b| a.display_order(b));

        let winner = items
            .iter()
            .filter(|item| item.active)
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| b.display_order(a))
            })
            .map(|item| item.id);

        self.items = items;
        self.tombstones.clear();
        self.set_active_id(winner);
        self.touch();
    }

    pub(crate) fn apply_change(&mut self, event: &ChangeEvent) -> ChangeOutcome {
        let Some(category_id) = self.category_id() else {
            return ChangeOutcome::Ignored(IgnoreReason::NoCategory);
        };
        let Some(row) = event.row() else {
            return ChangeOutcome::Ignored(IgnoreReason::MissingRow);
        };
        if row.category_id != category_id {
            return ChangeOutcome::Ignored(IgnoreReason::ForeignCategory);
        }

        match event.event_type {
            ChangeKind::Insert | ChangeKind::Update => self.upsert(row.clone()),
            ChangeKind::Delete => self.remove(row.id),
        }
    }

    /// Folds a row returned by one of our own writes into the projection.
    pub(crate) fn absorb_write(&mut self, row: Item) -> ChangeOutcome {
        if self.category_id() != Some(row.category_id) {
            return ChangeOutcome::Ignored(IgnoreReason::ForeignCategory);
        }
        self.upsert(row)
    }

    /// Marks one item active locally, ahead of the remote writes that will
    /// confirm it.
    pub(crate) fn mark_active_local(&mut self, item_id: ItemId) -> bool {
        if self.position(item_id).is_none() {
            return false;
        }
        self.set_active_id(Some(item_id));
        self.touch();
        true
    }

    pub(crate) fn clear_active_local(&mut self) {
        self.set_active_id(None);
        self.touch();
    }

    /// Settled means no write of ours is outstanding and, when there is
    /// anything to show, exactly one item is active.
    pub(crate) fn recompute_settled(&mut self, pending_writes: usize) {
        self.settled = pending_writes == 0 && (self.is_empty() || self.active_index.is_some());
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    fn upsert(&mut self, mut incoming: Item) -> ChangeOutcome {
        if self.tombstones.contains(&incoming.id) {
            return ChangeOutcome::Ignored(IgnoreReason::Deleted);
        }

        let current_active = self.active_item().map(|item| (item.id, item.updated_at));

        match self.position(incoming.id) {
            Some(index) => {
                if !incoming.supersedes(&self.items[index]) {
                    return ChangeOutcome::Ignored(IgnoreReason::Stale);
                }
                // An active claim older than the current active item's write
                // lost the race; keep the row but not the claim.
                if incoming.active {
                    if let Some((active_id, active_written)) = current_active {
                        if active_id != incoming.id && incoming.updated_at < active_written {
                            incoming.active = false;
                        }
                    }
                }
                self.items[index] = incoming;
            }
            None => {
                if incoming.active {
                    if let Some((_, active_written)) = current_active {
                        if incoming.updated_at < active_written {
                            incoming.active = false;
                        }
                    }
                }
                let at = self
                    .items
                    .partition_point(|existing| existing.display_order(&incoming).is_lt());
                self.items.insert(at, incoming);
            }
        }

        self.items.sort_by(|a, b| a.display_order(b));
        let next_active = self.resolve_active_after_upsert(current_active.map(|(id, _)| id));
        self.set_active_id(next_active);
        self.touch();
        ChangeOutcome::Applied
    }

    fn resolve_active_after_upsert(&self, previous: Option<ItemId>) -> Option<ItemId> {
        // A row that still claims `active` after the race check above is the
        // newest claim; otherwise the previous active item stays unless the
        // row that just arrived deactivated it.
        let claims: Vec<ItemId> = self
            .items
            .iter()
            .filter(|item| item.active && Some(item.id) != previous)
            .map(|item| item.id)
            .collect();
        if let Some(claim) = claims.last() {
            return Some(*claim);
        }
        previous.filter(|id| {
            self.items
                .iter()
                .any(|item| item.id == *id && item.active)
        })
    }

    fn remove(&mut self, item_id: ItemId) -> ChangeOutcome {
        if !self.tombstones.insert(item_id) {
            return ChangeOutcome::Ignored(IgnoreReason::Deleted);
        }
        let Some(index) = self.position(item_id) else {
            return ChangeOutcome::Ignored(IgnoreReason::UnknownItem);
        };

        let active_id = self.active_item().map(|item| item.id);
        self.items.remove(index);
        let survivor = active_id.filter(|id| *id != item_id);
        self.set_active_id(survivor);
        self.touch();
        ChangeOutcome::Applied
    }

    fn set_active_id(&mut self, active: Option<ItemId>) {
        for item in &mut self.items {
            item.active = Some(item.id) == active;
        }
        self.active_index = active.and_then(|id| self.position(id));
    }
}

#[cfg(test)]
#[path = "tests/projection_tests.rs"]
mod tests;
