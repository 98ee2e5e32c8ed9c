//! # Feed Synchronizer
//!
//! Keeps one authoritative `FeedState` per feed id and fans it out to
//! subscribers. Push and pull updates for a feed are merged into a single value.
//!
//! ## Core Design Principles:
//!
//! 1.  **Reference-counted feeds**: the first subscription to a feed id opens its
//!     channel and/or poll source; further subscriptions reuse them. When the last
//!     subscription goes away the transports are closed exactly once.
//!
//! 2.  **Single point of ordering**: every transport callback stamps the payload
//!     with the feed's next sequence number (an atomic counter) and forwards it to
//!     the feed's pump task. The pump is the only writer of the `FeedState`; it
//!     rejects anything not newer than the last accepted sequence and delivers
//!     snapshots to subscribers one at a time, in subscription order.
//!
//! 3.  **Re-entrant teardown**: subscriber callbacks run with no lock held, so
//!     they may unsubscribe (themselves or others) while being notified. Each
//!     subscriber's `active` flag is checked right before every invocation.
//!
//! 4.  **Errors are state**: transport failures, poll errors and schema
//!     mismatches land in `FeedState` and are delivered through the same
//!     `on_change` callback as data. `subscribe` never fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::feed::{
    ApplyOutcome, ConnectionStatus, Feed, FeedState, RawPayload, Update, UpdateSource,
};
use crate::core::lock;
use crate::errors::SyncError;
use crate::ingestors::transports::{
    ErrorFn, PullLink, PushLink, StatusFn, Transports, UpdateFn,
};

/// Subscriber callback; receives an immutable snapshot.
pub type ChangeFn = Arc<dyn Fn(Arc<FeedState>) + Send + Sync>;

struct Subscriber {
    id: u64,
    active: AtomicBool,
    on_change: ChangeFn,
}

/// What transports hand to the pump.
enum Inbound {
    Payload {
        source: UpdateSource,
        sequence: u64,
        received_at: Instant,
        raw: RawPayload,
    },
    Status {
        status: ConnectionStatus,
        error: Option<String>,
    },
    PullError(SyncError),
}

/// State shared by the pump, the transport callbacks and subscriptions.
struct FeedCell {
    feed: Feed,
    state: Mutex<FeedState>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_sequence: AtomicU64,
    cancel: CancellationToken,
}

impl FeedCell {
    fn new(feed: Feed) -> Self {
        let state = FeedState::new(feed.feed_id.clone());
        Self {
            feed,
            state: Mutex::new(state),
            subscribers: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn stamp(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn snapshot(&self) -> Arc<FeedState> {
        Arc::new(lock(&self.state).clone())
    }

    /// Applies one inbound event. Returns a snapshot when subscribers must be told.
    fn ingest(&self, inbound: Inbound) -> Option<Arc<FeedState>> {
        let mut state = lock(&self.state);
        let pull_only = !self.feed.pushing_enabled();

        let changed = match inbound {
            Inbound::Payload { source, sequence, received_at, raw } => match self.feed.shape.decode(raw) {
                Ok(payload) => {
                    let update = Update {
                        source,
                        received_at,
                        sequence,
                        payload: Arc::new(payload),
                    };
                    if pull_only && source == UpdateSource::Pull {
                        mark_pull_healthy(&mut state);
                    }
                    match state.apply_update(update) {
                        ApplyOutcome::Accepted => true,
                        ApplyOutcome::StaleUpdateDiscarded => {
                            log::debug!(
                                "Feed '{}': discarded stale {:?} update #{} (current #{})",
                                self.feed.feed_id,
                                source,
                                sequence,
                                state.last_sequence().unwrap_or_default()
                            );
                            false
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Feed '{}': {}", self.feed.feed_id, e);
                    state.record_error(&e);
                    true
                }
            },
            Inbound::Status { status, error } => state.apply_status(status, error),
            Inbound::PullError(e) => {
                if pull_only {
                    state.apply_status(ConnectionStatus::Failed, Some(e.to_string()))
                } else {
                    state.record_error(&e);
                    true
                }
            }
        };

        changed.then(|| Arc::new(state.clone()))
    }

    /// Delivers a snapshot to every still-active subscriber, in order.
    fn notify(&self, snapshot: Arc<FeedState>) {
        let subscribers = lock(&self.subscribers).clone();
        for subscriber in subscribers {
            if self.cancel.is_cancelled() {
                return;
            }
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.on_change)(Arc::clone(&snapshot));
            }
        }
    }
}

/// A pull-only feed reports its poll health as connection status.
fn mark_pull_healthy(state: &mut FeedState) {
    if state.connection_status == ConnectionStatus::Failed {
        state.apply_status(ConnectionStatus::Connecting, None);
    }
    state.apply_status(ConnectionStatus::Connected, None);
}

async fn pump(cell: Arc<FeedCell>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = cell.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        if let Some(snapshot) = cell.ingest(inbound) {
            cell.notify(snapshot);
        }
    }
    log::debug!("Pump for feed '{}' stopped.", cell.feed.feed_id);
}

struct FeedEntry {
    cell: Arc<FeedCell>,
    refcount: usize,
    push: Option<Box<dyn PushLink>>,
    pull: Option<Box<dyn PullLink>>,
}

impl FeedEntry {
    /// Releases the transports. Runs exactly once per entry, after removal
    /// from the registry.
    fn teardown(self) {
        self.cell.cancel.cancel();
        if let Some(push) = &self.push {
            push.close();
        }
        if let Some(pull) = &self.pull {
            pull.stop();
        }
        log::info!("Feed '{}' torn down.", self.cell.feed.feed_id);
    }
}

struct SyncInner {
    transports: Arc<dyn Transports>,
    feeds: Mutex<HashMap<String, FeedEntry>>,
    next_subscriber: AtomicU64,
}

impl SyncInner {
    fn open_feed(&self, feed: &Feed) -> FeedEntry {
        let cell = Arc::new(FeedCell::new(feed.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(Arc::clone(&cell), rx));

        let push = feed.endpoint_push.as_deref().map(|endpoint| {
            let on_update: UpdateFn = {
                let cell = Arc::clone(&cell);
                let tx = tx.clone();
                Arc::new(move |raw| {
                    let _ = tx.send(Inbound::Payload {
                        source: UpdateSource::Push,
                        sequence: cell.stamp(),
                        received_at: Instant::now(),
                        raw,
                    });
                })
            };
            let on_status: StatusFn = {
                let tx = tx.clone();
                Arc::new(move |status, error| {
                    let _ = tx.send(Inbound::Status { status, error });
                })
            };
            self.transports
                .open_push(endpoint, feed.subscribe_message.as_deref(), on_update, on_status)
        });

        let pull = feed
            .endpoint_pull
            .as_deref()
            .filter(|_| feed.polling_enabled())
            .map(|endpoint| {
                let on_update: UpdateFn = {
                    let cell = Arc::clone(&cell);
                    let tx = tx.clone();
                    Arc::new(move |raw| {
                        let _ = tx.send(Inbound::Payload {
                            source: UpdateSource::Pull,
                            sequence: cell.stamp(),
                            received_at: Instant::now(),
                            raw,
                        });
                    })
                };
                let on_error: ErrorFn = {
                    let tx = tx.clone();
                    Arc::new(move |err| {
                        let _ = tx.send(Inbound::PullError(err));
                    })
                };
                self.transports.start_pull(
                    endpoint,
                    Duration::from_millis(feed.poll_interval_ms),
                    on_update,
                    on_error,
                )
            });

        if push.is_none() && pull.is_none() {
            let mut state = lock(&cell.state);
            state.apply_status(
                ConnectionStatus::Failed,
                Some(format!("feed '{}' has no push endpoint and polling is disabled", feed.feed_id)),
            );
        }

        log::info!(
            "Feed '{}' opened (push: {}, pull: {}).",
            feed.feed_id,
            push.is_some(),
            pull.is_some()
        );

        FeedEntry {
            cell,
            refcount: 0,
            push,
            pull,
        }
    }

    fn release(&self, feed_id: &str, cell: &Arc<FeedCell>, subscriber_id: u64) {
        let torn_down = {
            let mut feeds = lock(&self.feeds);
            let Some(entry) = feeds.get_mut(feed_id) else {
                return;
            };
            if !Arc::ptr_eq(&entry.cell, cell) {
                return;
            }
            lock(&entry.cell.subscribers).retain(|s| s.id != subscriber_id);
            entry.refcount = entry.refcount.saturating_sub(1);
            lock(&entry.cell.state).subscriber_count = entry.refcount;
            if entry.refcount == 0 {
                feeds.remove(feed_id)
            } else {
                None
            }
        };

        if let Some(entry) = torn_down {
            entry.teardown();
        }
    }

    fn shutdown(&self) {
        let entries: Vec<FeedEntry> = lock(&self.feeds).drain().map(|(_, e)| e).collect();
        for entry in entries {
            for subscriber in lock(&entry.cell.subscribers).iter() {
                subscriber.active.store(false, Ordering::Release);
            }
            entry.teardown();
        }
    }
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// # Feed Synchronizer
///
/// Cheap to clone; clones share the same feed registry. Transports are closed
/// when the last subscriber of a feed leaves, on `shutdown()`, or when the last
/// clone is dropped.
#[derive(Clone)]
pub struct FeedSynchronizer {
    inner: Arc<SyncInner>,
}

impl FeedSynchronizer {
    pub fn new(transports: Arc<dyn Transports>) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                transports,
                feeds: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to `feed`, opening its transports on first use.
    ///
    /// A second subscription to the same `feed_id` shares the existing feed; its
    /// `feed` argument is then only used for logging a configuration mismatch.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, feed: Feed, on_change: F) -> Subscription
    where
        F: Fn(Arc<FeedState>) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber {
            id: self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            on_change: Arc::new(on_change),
        });

        let cell = {
            let mut feeds = lock(&self.inner.feeds);
            if feeds.get(&feed.feed_id).is_some_and(|e| e.cell.feed != feed) {
                log::warn!(
                    "Feed '{}' is already open with a different configuration; reusing it.",
                    feed.feed_id
                );
            }
            let entry = feeds
                .entry(feed.feed_id.clone())
                .or_insert_with(|| self.inner.open_feed(&feed));
            entry.refcount += 1;
            lock(&entry.cell.subscribers).push(Arc::clone(&subscriber));
            lock(&entry.cell.state).subscriber_count = entry.refcount;
            Arc::clone(&entry.cell)
        };

        Subscription {
            feed_id: feed.feed_id,
            subscriber,
            cell,
            sync: Arc::downgrade(&self.inner),
        }
    }

    /// Latest state of an open feed.
    pub fn current(&self, feed_id: &str) -> Option<Arc<FeedState>> {
        lock(&self.inner.feeds).get(feed_id).map(|e| e.cell.snapshot())
    }

    /// Asks the feed's poll source for an immediate request. Returns `false`
    /// when the feed is not open or does not poll.
    pub fn refresh(&self, feed_id: &str) -> bool {
        let feeds = lock(&self.inner.feeds);
        match feeds.get(feed_id).and_then(|e| e.pull.as_ref()) {
            Some(pull) => {
                pull.refresh();
                true
            }
            None => false,
        }
    }

    /// Sends a best-effort control message over the feed's push channel.
    pub fn send(&self, feed_id: &str, message: &str) -> bool {
        let feeds = lock(&self.inner.feeds);
        match feeds.get(feed_id).and_then(|e| e.push.as_ref()) {
            Some(push) => {
                push.send(message);
                true
            }
            None => false,
        }
    }

    /// Ids of the currently open feeds.
    pub fn feed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.feeds).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscriber_count(&self, feed_id: &str) -> usize {
        lock(&self.inner.feeds).get(feed_id).map_or(0, |e| e.refcount)
    }

    /// Tears down every feed. Outstanding subscriptions become inert.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    feed_id: String,
    subscriber: Arc<Subscriber>,
    cell: Arc<FeedCell>,
    sync: Weak<SyncInner>,
}

impl Subscription {
    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    /// Latest state of the feed this subscription is attached to.
    pub fn current(&self) -> Arc<FeedState> {
        self.cell.snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }

    /// Stops notifications and releases this subscription's reference. Safe to
    /// call from inside an `on_change` callback; the second call is a no-op.
    pub fn unsubscribe(&self) {
        if !self.subscriber.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(sync) = self.sync.upgrade() {
            sync.release(&self.feed_id, &self.cell, self.subscriber.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
