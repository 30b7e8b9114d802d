use std::sync::Arc;

use shared::domain::ItemId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{error::SyncError, reconciler::Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

impl Direction {
    /// Index to activate from `current` in a circular sequence of `len`
    /// items. Without a current item, `Next` starts at the front and
    /// `Previous` at the back.
    pub fn step(self, current: Option<usize>, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let index = match (self, current) {
            (Self::Next, Some(current)) => (current + 1) % len,
            (Self::Previous, Some(current)) => (current % len + len - 1) % len,
            (Self::Next, None) => 0,
            (Self::Previous, None) => len - 1,
        };
        Some(index)
    }
}

/// Moves the active item forward or backward. Requests are served one at a
/// time in arrival order, each against the projection left by the previous
/// one.
pub struct NavigationController {
    reconciler: Arc<Reconciler>,
    turn: Mutex<()>,
}

impl NavigationController {
    pub fn new(reconciler: Arc<Reconciler>) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            turn: Mutex::new(()),
        })
    }

    pub async fn next(&self) -> Result<Option<ItemId>, SyncError> {
        self.navigate(Direction::Next).await
    }

    pub async fn previous(&self) -> Result<Option<ItemId>, SyncError> {
        self.navigate(Direction::Previous).await
    }

    /// Activates the neighbour of the active item in `direction`. Returns the
    /// activated item, or `None` when there is nothing to navigate.
    pub async fn navigate(&self, direction: Direction) -> Result<Option<ItemId>, SyncError> {
        let _turn = self.turn.lock().await;
        let projection = self.reconciler.snapshot().await;
        let Some(index) = direction.step(projection.active_index, projection.len()) else {
            debug!(?direction, "nothing to navigate");
            return Ok(None);
        };
        let target = projection.items[index].id;
        debug!(
            ?direction,
            from = ?projection.active_index,
            to = index,
            item_id = target.0,
            "navigating"
        );
        self.reconciler.activate(target).await?;
        Ok(Some(target))
    }

    /// Activates the item at `index`; out-of-range indexes are a no-op.
    pub async fn go_to(&self, index: usize) -> Result<Option<ItemId>, SyncError> {
        let _turn = self.turn.lock().await;
        let projection = self.reconciler.snapshot().await;
        let Some(target) = projection.items.get(index).map(|item| item.id) else {
            debug!(index, len = projection.len(), "go_to index out of range");
            return Ok(None);
        };
        self.reconciler.activate(target).await?;
        Ok(Some(target))
    }
}

#[cfg(test)]
#[path = "tests/navigation_tests.rs"]
mod tests;
