use super::*;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
}

pub(crate) fn category(id: i64, name: &str) -> Category {
    Category {
        id: CategoryId(id),
        name: name.to_string(),
    }
}

/// Item `id` created at `id` seconds, written once at the same instant.
pub(crate) fn item(id: i64, category_id: i64, active: bool) -> Item {
    Item {
        id: ItemId(id),
        category_id: CategoryId(category_id),
        text: format!("item {id}"),
        active,
        created_at: at(id),
        revision: 1,
        updated_at: at(id),
    }
}

/// A later write of `base` with the given flag.
pub(crate) fn revised(base: &Item, revision: i64, active: bool, updated_secs: i64) -> Item {
    Item {
        active,
        revision,
        updated_at: at(updated_secs),
        ..base.clone()
    }
}

/// Polls the reconciler until `done` holds for its projection.
pub(crate) async fn wait_for(
    reconciler: &Reconciler,
    done: impl Fn(&Projection) -> bool,
) -> Projection {
    for _ in 0..200 {
        let projection = reconciler.snapshot().await;
        if done(&projection) {
            return projection;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("projection never reached the expected state");
}

/// In-memory store with the server's write semantics: each write bumps the
/// row's revision and stamps it with a strictly later time.
pub(crate) struct TestRemoteStore {
    categories: Vec<Category>,
    rows: Mutex<Vec<Item>>,
    clock: AtomicU64,
    fail_fetch: Option<String>,
    fail_deactivate: Option<String>,
    activate_failures: Mutex<u32>,
    deactivate_gate: Option<Arc<Notify>>,
    writes: Mutex<Vec<String>>,
}

impl TestRemoteStore {
    pub(crate) fn with_rows(categories: Vec<Category>, rows: Vec<Item>) -> Self {
        Self {
            categories,
            rows: Mutex::new(rows),
            clock: AtomicU64::new(1_000),
            fail_fetch: None,
            fail_deactivate: None,
            activate_failures: Mutex::new(0),
            deactivate_gate: None,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_fetch(mut self, err: impl Into<String>) -> Self {
        self.fail_fetch = Some(err.into());
        self
    }

    pub(crate) fn failing_deactivate(mut self, err: impl Into<String>) -> Self {
        self.fail_deactivate = Some(err.into());
        self
    }

    /// The next `count` activate writes fail.
    pub(crate) fn failing_activations(self, count: u32) -> Self {
        Self {
            activate_failures: Mutex::new(count),
            ..self
        }
    }

    /// Deactivate-all writes wait for `gate` before touching any row.
    pub(crate) fn gated_deactivate(mut self, gate: Arc<Notify>) -> Self {
        self.deactivate_gate = Some(gate);
        self
    }

    pub(crate) async fn writes(&self) -> Vec<String> {
        self.writes.lock().await.clone()
    }

    pub(crate) async fn row(&self, item_id: ItemId) -> Option<Item> {
        self.rows
            .lock()
            .await
            .iter()
            .find(|row| row.id == item_id)
            .cloned()
    }

    pub(crate) async fn remove(&self, item_id: ItemId) -> Option<Item> {
        let mut rows = self.rows.lock().await;
        let index = rows.iter().position(|row| row.id == item_id)?;
        Some(rows.remove(index))
    }

    fn tick(&self) -> DateTime<Utc> {
        at(self.clock.fetch_add(1, Ordering::SeqCst) as i64)
    }
}

#[async_trait]
impl RemoteStore for TestRemoteStore {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        Ok(self.categories.clone())
    }

    async fn fetch_items(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        if let Some(err) = &self.fail_fetch {
            return Err(anyhow!(err.clone()));
        }
        let mut items: Vec<Item> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.category_id == category_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.display_order(b));
        Ok(items)
    }

    async fn deactivate_all(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        if let Some(gate) = &self.deactivate_gate {
            gate.notified().await;
        }
        self.writes
            .lock()
            .await
            .push(format!("deactivate:{}", category_id.0));
        if let Some(err) = &self.fail_deactivate {
            return Err(anyhow!(err.clone()));
        }
        let mut rows = self.rows.lock().await;
        let mut changed = Vec::new();
        for row in rows
            .iter_mut()
            .filter(|row| row.category_id == category_id && row.active)
        {
            row.active = false;
            row.revision += 1;
            row.updated_at = self.tick();
            changed.push(row.clone());
        }
        Ok(changed)
    }

    async fn set_active(&self, item_id: ItemId, active: bool) -> Result<Item> {
        self.writes
            .lock()
            .await
            .push(format!("set_active:{}:{active}", item_id.0));
        {
            let mut failures = self.activate_failures.lock().await;
            if active && *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("activate write rejected"));
            }
        }
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.iter_mut().find(|row| row.id == item_id) else {
            return Err(anyhow!("item {} not found", item_id.0));
        };
        row.active = active;
        row.revision += 1;
        row.updated_at = self.tick();
        Ok(row.clone())
    }
}

/// Feed whose events are pushed by the test.
pub(crate) struct TestChangeFeed {
    next_handle: AtomicU64,
    senders: Mutex<Vec<(SubscriptionHandle, ChangeFilter, mpsc::UnboundedSender<ChangeEvent>)>>,
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
}

impl TestChangeFeed {
    pub(crate) fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            senders: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    /// Sender of the most recent subscription for `category_id`.
    pub(crate) async fn sender(
        &self,
        category_id: CategoryId,
    ) -> Option<mpsc::UnboundedSender<ChangeEvent>> {
        self.senders
            .lock()
            .await
            .iter()
            .rev()
            .find(|(_, filter, _)| filter.category_id == category_id)
            .map(|(_, _, tx)| tx.clone())
    }

    pub(crate) async fn push(&self, event: ChangeEvent) {
        let category_id = event.category_id().expect("event carries a row");
        self.sender(category_id)
            .await
            .expect("subscription for the event's category")
            .send(event)
            .expect("pump is running");
    }

    /// Drops every sender, ending the subscriptions' event streams.
    pub(crate) async fn close_all(&self) {
        self.senders.lock().await.clear();
    }

    pub(crate) async fn subscription_count(&self) -> usize {
        self.senders.lock().await.len()
    }

    pub(crate) async fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().await.clone()
    }
}

#[async_trait]
impl ChangeFeed for TestChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::unbounded_channel();
        self.senders.lock().await.push((handle, filter, tx));
        Ok(FeedSubscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.senders.lock().await.retain(|(h, _, _)| *h != handle);
        self.unsubscribed.lock().await.push(handle);
        Ok(())
    }
}

#[tokio::test]
async fn missing_remote_store_reports_unavailable() {
    let store = MissingRemoteStore;
    let err = store
        .fetch_items(CategoryId(4))
        .await
        .expect_err("missing store must fail");
    assert!(err.to_string().contains("category 4"));
    assert!(store.set_active(ItemId(9), true).await.is_err());
    assert!(store.list_categories().await.is_err());
}

#[tokio::test]
async fn missing_change_feed_rejects_subscriptions() {
    let feed = MissingChangeFeed;
    let err = feed
        .subscribe(ChangeFilter::category(CategoryId(2)))
        .await
        .err()
        .expect("missing feed must fail");
    assert!(err.to_string().contains("category 2"));
    feed.unsubscribe(SubscriptionHandle(1))
        .await
        .expect("unsubscribe is a no-op");
}

#[tokio::test]
async fn test_store_bumps_revision_on_every_write() {
    let store = TestRemoteStore::with_rows(
        vec![category(1, "Juan 1")],
        vec![item(1, 1, true), item(2, 1, false)],
    );

    let changed = store
        .deactivate_all(CategoryId(1))
        .await
        .expect("deactivate");
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].id, ItemId(1));
    assert_eq!(changed[0].revision, 2);

    let row = store.set_active(ItemId(2), true).await.expect("activate");
    assert!(row.active);
    assert_eq!(row.revision, 2);
    assert!(row.updated_at > changed[0].updated_at);
    assert_eq!(
        store.writes().await,
        vec!["deactivate:1".to_string(), "set_active:2:true".to_string()]
    );
}
