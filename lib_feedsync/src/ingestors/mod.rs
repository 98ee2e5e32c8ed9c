//! # Data Ingestors Module
//!
//! The transport half of `lib_feedsync`. Each submodule owns the lifecycle of one
//! kind of upstream connection and reports what it receives through plain
//! callbacks; none of them knows about feeds, ordering or subscribers.
//!
//! ## Contained Modules:
//! - **`channel`**: A reconnecting WebSocket client. One handle, one endpoint,
//!   one status machine (`Connecting`, `Connected`, `Failed`, `Disconnected`).
//! - **`polling`**: A self-scheduling HTTP poller that never has more than one
//!   request in flight.
//! - **`transports`**: The seam through which the synchronizer opens channels
//!   and poll sources, so that tests can substitute recording doubles.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Reconnecting WebSocket push channel.
pub mod channel;
/// Interval-driven pull source with skip-if-in-flight.
pub mod polling;
/// Factory trait for push and pull links.
pub mod transports;

// --- Public API Re-exports ---
pub use channel::{ChannelConfig, ChannelHandle, ReconnectPolicy, TransportChannel};
pub use polling::{HttpFetcher, PollHandle, PollSource, PullFetcher};
pub use transports::{NetworkTransports, PullLink, PushLink, Transports};
