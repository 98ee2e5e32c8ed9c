//! # View Binding
//!
//! Connects a render callback to one feed. The callback sees the current state
//! once at bind time and then every later change. After `teardown()` returns, no
//! new render is started; a render already running on another thread is allowed
//! to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::feed::{Feed, FeedState};
use crate::core::lock;
use crate::core::synchronizer::{FeedSynchronizer, Subscription};

type RenderFn = Box<dyn Fn(&FeedState) + Send + Sync>;

struct RenderGate {
    active: AtomicBool,
    rendered_revision: Mutex<Option<u64>>,
    render: RenderFn,
}

impl RenderGate {
    /// Renders `state` unless the binding is torn down or `state` is not newer
    /// than what was last rendered.
    fn offer(&self, state: &FeedState) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        {
            let mut last = lock(&self.rendered_revision);
            if last.is_some_and(|rev| state.revision <= rev) {
                return;
            }
            *last = Some(state.revision);
        }
        if self.active.load(Ordering::Acquire) {
            (self.render)(state);
        }
    }
}

/// A live render subscription. Dropping it tears it down.
#[must_use = "dropping a ViewBinding tears it down immediately"]
pub struct ViewBinding {
    gate: Arc<RenderGate>,
    subscription: Subscription,
}

impl ViewBinding {
    /// Subscribes `render` to `feed` and renders the current state right away.
    pub fn bind<F>(sync: &FeedSynchronizer, feed: Feed, render: F) -> Self
    where
        F: Fn(&FeedState) + Send + Sync + 'static,
    {
        let gate = Arc::new(RenderGate {
            active: AtomicBool::new(true),
            rendered_revision: Mutex::new(None),
            render: Box::new(render),
        });

        let subscription = {
            let gate = Arc::clone(&gate);
            sync.subscribe(feed, move |state| gate.offer(&state))
        };

        gate.offer(&subscription.current());
        log::debug!("View bound to feed '{}'.", subscription.feed_id());

        Self { gate, subscription }
    }

    pub fn feed_id(&self) -> &str {
        self.subscription.feed_id()
    }

    pub fn is_active(&self) -> bool {
        self.gate.active.load(Ordering::Acquire)
    }

    /// Latest state of the bound feed, whether or not it was rendered.
    pub fn current(&self) -> Arc<FeedState> {
        self.subscription.current()
    }

    /// Stops rendering and releases the subscription. Idempotent, and safe to
    /// call from inside the render callback.
    pub fn teardown(&self) {
        if self.gate.active.swap(false, Ordering::AcqRel) {
            self.subscription.unsubscribe();
            log::debug!("View on feed '{}' torn down.", self.subscription.feed_id());
        }
    }
}

impl Drop for ViewBinding {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl FeedSynchronizer {
    /// Shorthand for `ViewBinding::bind(self, feed, render)`.
    pub fn bind<F>(&self, feed: Feed, render: F) -> ViewBinding
    where
        F: Fn(&FeedState) + Send + Sync + 'static,
    {
        ViewBinding::bind(self, feed, render)
    }
}
