use std::sync::{Arc, Weak};

use shared::{
    domain::{Category, ItemId},
    protocol::{ChangeEvent, ChangeFilter},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{FetchTarget, SyncError, WriteStage},
    projection::{ChangeOutcome, IgnoreReason, Projection},
    ChangeFeed, FeedSubscription, RemoteStore, SubscriptionHandle,
};

/// The activate write is tried once more after a failure, never the
/// deactivate-all write.
const ACTIVATE_WRITE_ATTEMPTS: u32 = 2;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    ProjectionChanged(Projection),
    SyncFailed(String),
}

/// Owns the projection of the selected category and is the only writer of
/// it. Remote change events, local activations and category switches all go
/// through here; everyone else works from [`Reconciler::snapshot`].
pub struct Reconciler {
    store: Arc<dyn RemoteStore>,
    feed: Arc<dyn ChangeFeed>,
    inner: Mutex<ReconcilerState>,
    /// Held for the whole of [`Reconciler::activate`] so activations land
    /// remotely in the order they were requested.
    activation: Mutex<()>,
    events: broadcast::Sender<ReconcilerEvent>,
}

struct ReconcilerState {
    projection: Projection,
    /// Bumped on every category selection; work started under an older epoch
    /// is discarded when it completes.
    epoch: u64,
    subscription: Option<ActiveSubscription>,
    pending_writes: usize,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn RemoteStore>, feed: Arc<dyn ChangeFeed>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            store,
            feed,
            inner: Mutex::new(ReconcilerState {
                projection: Projection::empty(),
                epoch: 0,
                subscription: None,
                pending_writes: 0,
            }),
            activation: Mutex::new(()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.events.subscribe()
    }

    /// Read-only copy of the current projection.
    pub async fn snapshot(&self) -> Projection {
        self.inner.lock().await.projection.clone()
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, SyncError> {
        self.store
            .list_categories()
            .await
            .map_err(|source| SyncError::Fetch {
                target: FetchTarget::Categories,
                source,
            })
    }

    /// Replaces the projection with one for `category`: subscribes to its
    /// change feed, loads its items and activates the first one when none is
    /// active. A failed load leaves an empty, settled projection behind; a
    /// failed subscription leaves a loaded projection with `live = false`.
    pub async fn select_category(self: &Arc<Self>, category: Category) -> Result<(), SyncError> {
        let category_id = category.id;
        let (epoch, previous) = {
            let mut state = self.inner.lock().await;
            state.epoch += 1;
            state.pending_writes = 0;
            state.projection = Projection::loading(category.clone());
            self.emit_projection(&state.projection);
            (state.epoch, state.subscription.take())
        };
        info!(category_id = category_id.0, epoch, "selecting category");

        if let Some(previous) = previous {
            self.release_subscription(previous).await;
        }

        // Subscribe before fetching so writes landing in between are still
        // seen; revisions make the overlap harmless.
        let subscription = self
            .feed
            .subscribe(ChangeFilter::category(category_id))
            .await;
        let fetched = self.store.fetch_items(category_id).await;

        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            drop(state);
            debug!(category_id = category_id.0, epoch, "category selection superseded");
            if let Ok(subscription) = subscription {
                self.unsubscribe_quietly(subscription.handle).await;
            }
            return Ok(());
        }

        let items = match fetched {
            Ok(items) => items,
            Err(source) => {
                state.projection.settled = true;
                state.projection.live = false;
                state.projection.touch();
                self.emit_projection(&state.projection);
                drop(state);
                if let Ok(subscription) = subscription {
                    self.unsubscribe_quietly(subscription.handle).await;
                }
                let err = SyncError::Fetch {
                    target: FetchTarget::Items(category_id),
                    source,
                };
                warn!(category_id = category_id.0, %err, "category load failed");
                self.emit_failure(&err);
                return Err(err);
            }
        };

        state.projection.load(items);
        let subscription_error = match subscription {
            Ok(subscription) => {
                state.subscription = Some(self.start_pump(epoch, subscription));
                state.projection.live = true;
                None
            }
            Err(source) => {
                state.projection.live = false;
                Some(source)
            }
        };

        let auto_activate = if state.projection.active_index.is_none() {
            state.projection.items.first().map(|item| item.id)
        } else {
            None
        };
        let pending = state.pending_writes + usize::from(auto_activate.is_some());
        state.projection.recompute_settled(pending);
        info!(
            category_id = category_id.0,
            items = state.projection.len(),
            active_index = ?state.projection.active_index,
            live = state.projection.live,
            "category loaded"
        );
        self.emit_projection(&state.projection);
        drop(state);

        let subscription_error = subscription_error.map(|source| {
            let err = SyncError::Subscription {
                category_id,
                source,
            };
            warn!(%err, "continuing without live updates");
            self.emit_failure(&err);
            err
        });

        if let Some(first) = auto_activate {
            info!(
                category_id = category_id.0,
                item_id = first.0,
                "no active item; activating the first one"
            );
            self.activate(first).await?;
        }

        match subscription_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reloads the current category from scratch.
    pub async fn resync(self: &Arc<Self>) -> Result<(), SyncError> {
        let category = self.inner.lock().await.projection.category.clone();
        match category {
            Some(category) => self.select_category(category).await,
            None => Ok(()),
        }
    }

    /// Drops the live subscription and forgets the current category.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.inner.lock().await;
            state.epoch += 1;
            state.pending_writes = 0;
            state.projection = Projection::empty();
            self.emit_projection(&state.projection);
            state.subscription.take()
        };
        if let Some(previous) = previous {
            self.release_subscription(previous).await;
        }
    }

    pub async fn apply_remote_change(&self, event: ChangeEvent) -> ChangeOutcome {
        let mut state = self.inner.lock().await;
        self.apply_locked(&mut state, &event)
    }

    async fn apply_feed_event(&self, epoch: u64, event: ChangeEvent) -> ChangeOutcome {
        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            return ChangeOutcome::Ignored(IgnoreReason::SupersededSubscription);
        }
        self.apply_locked(&mut state, &event)
    }

    fn apply_locked(&self, state: &mut ReconcilerState, event: &ChangeEvent) -> ChangeOutcome {
        let outcome = state.projection.apply_change(event);
        match outcome {
            ChangeOutcome::Applied => {
                let pending = state.pending_writes;
                state.projection.recompute_settled(pending);
                debug!(
                    event_type = ?event.event_type,
                    item_id = ?event.item_id().map(|id| id.0),
                    active_index = ?state.projection.active_index,
                    settled = state.projection.settled,
                    "applied remote change"
                );
                self.emit_projection(&state.projection);
            }
            ChangeOutcome::Ignored(reason) => {
                debug!(
                    event_type = ?event.event_type,
                    item_id = ?event.item_id().map(|id| id.0),
                    ?reason,
                    "ignored remote change"
                );
            }
        }
        outcome
    }

    async fn feed_closed(&self, epoch: u64) {
        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            return;
        }
        state.projection.live = false;
        state.projection.touch();
        self.emit_projection(&state.projection);
        warn!(epoch, "change feed closed; projection may go stale");
        let _ = self.events.send(ReconcilerEvent::SyncFailed(
            "change feed closed; call resync to reconnect".to_string(),
        ));
    }

    /// Makes `item_id` the active item of the current category: deactivates
    /// every item remotely, then activates the target. The projection shows
    /// the target immediately and stays unsettled until both writes return.
    /// Once the deactivate-all write is out, the activate write is sent even
    /// if the category was switched meanwhile; only its result is dropped.
    pub async fn activate(&self, item_id: ItemId) -> Result<(), SyncError> {
        let _turn = self.activation.lock().await;
        let (epoch, category_id, prior) = {
            let mut state = self.inner.lock().await;
            let Some(category_id) = state.projection.category_id() else {
                return Err(SyncError::UnknownItem(item_id));
            };
            let prior = state.projection.active_item().map(|item| item.id);
            if !state.projection.mark_active_local(item_id) {
                return Err(SyncError::UnknownItem(item_id));
            }
            state.pending_writes += 1;
            state.projection.settled = false;
            self.emit_projection(&state.projection);
            (state.epoch, category_id, prior)
        };
        info!(
            category_id = category_id.0,
            item_id = item_id.0,
            prior = ?prior.map(|id| id.0),
            "activating item"
        );

        match self.store.deactivate_all(category_id).await {
            Ok(rows) => {
                let mut state = self.inner.lock().await;
                if state.epoch == epoch {
                    for row in rows {
                        state.projection.absorb_write(row);
                    }
                    if state.projection.active_index.is_none() {
                        state.projection.mark_active_local(item_id);
                    }
                    self.emit_projection(&state.projection);
                } else {
                    debug!(
                        item_id = item_id.0,
                        "category switched mid-activation; finishing the remote write only"
                    );
                }
            }
            Err(source) => {
                let err = SyncError::Write {
                    item_id,
                    stage: WriteStage::Deactivate,
                    attempts: 1,
                    source,
                };
                if self.fail_activation(epoch, item_id, prior).await {
                    warn!(%err, "activation aborted");
                    self.emit_failure(&err);
                    return Err(err);
                }
                return Ok(());
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.set_active(item_id, true).await {
                Ok(row) => {
                    let mut state = self.inner.lock().await;
                    if state.epoch != epoch {
                        debug!(item_id = item_id.0, "discarding stale activation");
                        return Ok(());
                    }
                    state.pending_writes = state.pending_writes.saturating_sub(1);
                    state.projection.absorb_write(row);
                    let pending = state.pending_writes;
                    state.projection.recompute_settled(pending);
                    state.projection.touch();
                    debug!(
                        item_id = item_id.0,
                        attempts,
                        settled = state.projection.settled,
                        "activation confirmed"
                    );
                    self.emit_projection(&state.projection);
                    return Ok(());
                }
                Err(source) if attempts < ACTIVATE_WRITE_ATTEMPTS => {
                    warn!(
                        item_id = item_id.0,
                        attempts,
                        error = %source,
                        "activate write failed; retrying once"
                    );
                }
                Err(source) => {
                    let err = SyncError::Write {
                        item_id,
                        stage: WriteStage::Activate,
                        attempts,
                        source,
                    };
                    if !self.fail_activation(epoch, item_id, prior).await {
                        return Ok(());
                    }
                    warn!(%err, "activation failed; restored previous active item");
                    self.emit_failure(&err);
                    if let Some(prior) = prior.filter(|prior| *prior != item_id) {
                        self.restore_remote(epoch, prior).await;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Rolls the projection back to `prior` after a failed activation.
    /// Returns false when the activation belonged to a superseded category.
    async fn fail_activation(&self, epoch: u64, target: ItemId, prior: Option<ItemId>) -> bool {
        let mut state = self.inner.lock().await;
        if state.epoch != epoch {
            debug!(item_id = target.0, "discarding stale activation failure");
            return false;
        }
        state.pending_writes = state.pending_writes.saturating_sub(1);

        // A remote claim that landed meanwhile stays; only our own optimistic
        // mark is rolled back.
        let current = state.projection.active_item().map(|item| item.id);
        if current.is_none() || current == Some(target) {
            match prior {
                Some(prior) if state.projection.mark_active_local(prior) => {}
                _ => state.projection.clear_active_local(),
            }
        }
        state.projection.settled = state.pending_writes == 0;
        state.projection.touch();
        self.emit_projection(&state.projection);
        true
    }

    /// Best-effort remote write putting `prior` back after a failed activation.
    async fn restore_remote(&self, epoch: u64, prior: ItemId) {
        match self.store.set_active(prior, true).await {
            Ok(row) => {
                let mut state = self.inner.lock().await;
                if state.epoch == epoch && state.projection.absorb_write(row).is_applied() {
                    let pending = state.pending_writes;
                    state.projection.recompute_settled(pending);
                    self.emit_projection(&state.projection);
                }
            }
            Err(error) => {
                warn!(item_id = prior.0, %error, "could not restore previous active item remotely");
            }
        }
    }

    fn start_pump(self: &Arc<Self>, epoch: u64, subscription: FeedSubscription) -> ActiveSubscription {
        let FeedSubscription { handle, events } = subscription;
        let pump = tokio::spawn(pump_feed(Arc::downgrade(self), epoch, events));
        ActiveSubscription { handle, pump }
    }

    async fn release_subscription(&self, subscription: ActiveSubscription) {
        let handle = subscription.handle;
        drop(subscription);
        self.unsubscribe_quietly(handle).await;
    }

    async fn unsubscribe_quietly(&self, handle: SubscriptionHandle) {
        if let Err(error) = self.feed.unsubscribe(handle).await {
            warn!(handle = handle.0, %error, "failed to unsubscribe from change feed");
        }
    }

    fn emit_projection(&self, projection: &Projection) {
        let _ = self
            .events
            .send(ReconcilerEvent::ProjectionChanged(projection.clone()));
    }

    fn emit_failure(&self, err: &SyncError) {
        let _ = self.events.send(ReconcilerEvent::SyncFailed(err.to_string()));
    }
}

async fn pump_feed(
    reconciler: Weak<Reconciler>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(reconciler) = reconciler.upgrade() else {
            return;
        };
        reconciler.apply_feed_event(epoch, event).await;
    }
    if let Some(reconciler) = reconciler.upgrade() {
        reconciler.feed_closed(epoch).await;
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
