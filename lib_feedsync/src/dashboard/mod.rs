//! # Security Dashboard Module
//!
//! Domain layer on top of the generic feed machinery: typed payload models for
//! the security operations dashboard and its REST mutation endpoints.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Decoded payloads (stats, server health, attack logs, blocked IPs, alerts).
pub mod models;
/// Fire-and-refresh mutation calls.
pub mod api;

pub use api::DashboardApi;
pub use models::{
    AlertPreferences, AttackLog, AttackLogBook, AttackLogEvent, BlockList, BlockedIp, HealthClass,
    ServerHealth, Severity, StatCard, StatsSeries,
};
