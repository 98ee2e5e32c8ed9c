//! Client-side live-data synchronization for the security operations dashboard.
//!
//! A `FeedSynchronizer` keeps one authoritative `FeedState` per feed, fed by a
//! reconnecting WebSocket channel, an HTTP poll source, or both, and fans every
//! change out to its subscribers. `ViewBinding` ties a render callback to that
//! state and guarantees no render after teardown.

pub mod configs;
pub mod core;
pub mod dashboard;
pub mod errors;
pub mod ingestors;
pub mod loggers;
pub mod retrieve;

// Re-export the types a host needs to wire up feeds.
pub use crate::configs::{ConfigError, ConfigOverrides, DashboardConfig};
pub use crate::core::{
    ConnectionStatus, Feed, FeedState, FeedSynchronizer, PayloadShape, Subscription, Update, UpdateSource,
    ViewBinding,
};
pub use crate::errors::SyncError;
pub use crate::ingestors::{NetworkTransports, ReconnectPolicy, Transports};
