//! # Configuration Modules
//!
//! Layered configuration for hosts embedding the feed synchronizer.

/// Defaults, JSON5 file, environment and CLI layers for a dashboard host.
pub mod config_dashboard;

pub use config_dashboard::{ConfigError, ConfigOverrides, DashboardConfig, FeedConfig};
