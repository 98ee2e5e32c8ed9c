//! # Transport Seam
//!
//! The `FeedSynchronizer` never constructs channels or poll sources directly.
//! It asks a `Transports` implementation to open them and keeps the returned
//! link objects as exclusive owner. `NetworkTransports` is the production
//! implementation (WebSocket + HTTP); tests substitute recording doubles.

use std::sync::Arc;
use std::time::Duration;

use crate::core::feed::{ConnectionStatus, RawPayload};
use crate::errors::SyncError;
use crate::ingestors::channel::{ChannelConfig, ReconnectPolicy, TransportChannel};
use crate::ingestors::polling::{PollSource, PullFetcher};

/// Fired for every inbound payload.
pub type UpdateFn = Arc<dyn Fn(RawPayload) + Send + Sync>;
/// Fired on every channel status transition, with an error text for `Failed`.
pub type StatusFn = Arc<dyn Fn(ConnectionStatus, Option<String>) + Send + Sync>;
/// Fired for every failed poll request.
pub type ErrorFn = Arc<dyn Fn(SyncError) + Send + Sync>;

/// Owner-side control of an open push channel.
pub trait PushLink: Send + Sync {
    /// Releases the connection. Idempotent.
    fn close(&self);
    /// Best-effort outbound control message.
    fn send(&self, message: &str);
}

/// Owner-side control of a running poll source.
pub trait PullLink: Send + Sync {
    /// Cancels the timer. Idempotent.
    fn stop(&self);
    /// Requests an immediate out-of-band poll.
    fn refresh(&self);
}

/// Factory for the push and pull halves of a feed.
pub trait Transports: Send + Sync {
    fn open_push(
        &self,
        endpoint: &str,
        subscribe_message: Option<&str>,
        on_update: UpdateFn,
        on_status: StatusFn,
    ) -> Box<dyn PushLink>;

    fn start_pull(
        &self,
        endpoint: &str,
        interval: Duration,
        on_update: UpdateFn,
        on_error: ErrorFn,
    ) -> Box<dyn PullLink>;
}

/// WebSocket channels and HTTP polling.
pub struct NetworkTransports {
    reconnect: ReconnectPolicy,
    idle_timeout: Option<Duration>,
    fetcher: Arc<dyn PullFetcher>,
}

impl NetworkTransports {
    pub fn new(fetcher: Arc<dyn PullFetcher>) -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            idle_timeout: None,
            fetcher,
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Transports for NetworkTransports {
    fn open_push(
        &self,
        endpoint: &str,
        subscribe_message: Option<&str>,
        on_update: UpdateFn,
        on_status: StatusFn,
    ) -> Box<dyn PushLink> {
        let config = ChannelConfig {
            endpoint: endpoint.to_string(),
            subscribe_message: subscribe_message.map(str::to_string),
            reconnect: self.reconnect.clone(),
            idle_timeout: self.idle_timeout,
        };
        Box::new(TransportChannel::open(config, on_update, on_status))
    }

    fn start_pull(
        &self,
        endpoint: &str,
        interval: Duration,
        on_update: UpdateFn,
        on_error: ErrorFn,
    ) -> Box<dyn PullLink> {
        Box::new(PollSource::start(
            endpoint.to_string(),
            interval,
            Arc::clone(&self.fetcher),
            on_update,
            on_error,
        ))
    }
}
