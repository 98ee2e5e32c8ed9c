//! # Core Synchronization Module
//!
//! This module holds the transport-independent half of `lib_feedsync`: the feed
//! data model, the synchronizer that owns one authoritative state per feed, and
//! the view binding that connects a render callback to that state.
//!
//! ## Core Components:
//!
//! - **`feed`**: `Feed`, `Update`, `FeedState` and the `ConnectionStatus`
//!   machine. Ordering and last-known-good rules live here.
//!
//! - **`synchronizer`**: A reference-counted feed registry. The first subscriber
//!   to a feed id opens its transports, the last one to leave closes them. All
//!   updates for a feed funnel through a single pump task.
//!
//! - **`binding`**: Ties a render callback to a feed's lifecycle and guarantees
//!   that no render starts after teardown.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Feed descriptors, updates and the authoritative per-feed state.
pub mod feed;
/// Reference-counted feed registry and update fan-out.
pub mod synchronizer;
/// Lifecycle-bound render callbacks.
pub mod binding;

// --- Public API Re-exports ---
pub use feed::{ConnectionStatus, Feed, FeedState, PayloadShape, Update, UpdateSource};
pub use synchronizer::{FeedSynchronizer, Subscription};
pub use binding::ViewBinding;

/// Locks a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
