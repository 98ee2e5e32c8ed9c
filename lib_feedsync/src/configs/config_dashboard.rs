//! # Dashboard Configuration
//!
//! Layered configuration for a feed-consuming host. Sources, lowest precedence
//! first:
//!
//! 1. built-in defaults (`DashboardConfig::default()`),
//! 2. a JSON5 file (`FEEDSYNC_CONFIG_PATH`, default `feedsync.json5`),
//! 3. `FEEDSYNC_*` environment variables (a `.env` file is honoured),
//! 4. overrides supplied by the host, usually parsed from its command line.
//!
//! Every layer except the defaults is a `ConfigOverrides`, where `Some` wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::core::feed::{Feed, PayloadShape};
use crate::dashboard::api::DashboardApi;
use crate::errors::SyncError;
use crate::ingestors::channel::ReconnectPolicy;
use crate::ingestors::polling::HttpFetcher;
use crate::ingestors::transports::NetworkTransports;
use crate::retrieve::ky_http::ApiClient;

pub const CONFIG_PATH_ENV: &str = "FEEDSYNC_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "feedsync.json5";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// One feed as written in configuration. Endpoints may be relative to the
/// base URLs or absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    pub feed_id: String,
    #[serde(default)]
    pub push: Option<String>,
    #[serde(default)]
    pub pull: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub subscribe_message: Option<String>,
    #[serde(default)]
    pub shape: PayloadShape,
}

/// A partial configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    pub api_base_url: Option<String>,
    pub ws_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub reconnect_max_retries: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    pub http_retries: Option<u32>,
    pub mutation_retries: Option<u32>,
    pub feeds: Option<Vec<FeedConfig>>,
}

impl ConfigOverrides {
    /// `other` overrides `self` for every `Some` value.
    pub fn merge(self, other: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            api_base_url: other.api_base_url.or(self.api_base_url),
            ws_base_url: other.ws_base_url.or(self.ws_base_url),
            auth_token: other.auth_token.or(self.auth_token),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_max_retries: other.reconnect_max_retries.or(self.reconnect_max_retries),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            http_retries: other.http_retries.or(self.http_retries),
            mutation_retries: other.mutation_retries.or(self.mutation_retries),
            feeds: other.feeds.or(self.feeds),
        }
    }

    /// Reads a JSON5 file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        json5::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Reads the `FEEDSYNC_*` variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
            value
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got '{}'", key, v)))
                })
                .transpose()
        }

        Ok(ConfigOverrides {
            api_base_url: lookup("FEEDSYNC_API_URL"),
            ws_base_url: lookup("FEEDSYNC_WS_URL"),
            auth_token: lookup("FEEDSYNC_AUTH_TOKEN"),
            reconnect_base_delay_ms: number("FEEDSYNC_RECONNECT_BASE_DELAY_MS", lookup("FEEDSYNC_RECONNECT_BASE_DELAY_MS"))?,
            reconnect_max_delay_ms: number("FEEDSYNC_RECONNECT_MAX_DELAY_MS", lookup("FEEDSYNC_RECONNECT_MAX_DELAY_MS"))?,
            reconnect_max_retries: number("FEEDSYNC_RECONNECT_MAX_RETRIES", lookup("FEEDSYNC_RECONNECT_MAX_RETRIES"))?,
            idle_timeout_secs: number("FEEDSYNC_IDLE_TIMEOUT_SECS", lookup("FEEDSYNC_IDLE_TIMEOUT_SECS"))?,
            ..Default::default()
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

/// Fully resolved configuration of a dashboard host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub auth_token: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_retries: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    /// Retries per poll request. Each tick is already a retry, so 0 by default.
    pub http_retries: u32,
    pub mutation_retries: u32,
    pub feeds: Vec<FeedConfig>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/".to_string(),
            ws_base_url: "ws://localhost:8000/".to_string(),
            auth_token: None,
            reconnect_base_delay_ms: 5000,
            reconnect_max_delay_ms: 5000,
            reconnect_max_retries: None,
            idle_timeout_secs: None,
            http_retries: 0,
            mutation_retries: 3,
            feeds: vec![
                FeedConfig {
                    feed_id: "attack-stats".to_string(),
                    push: Some("ws/stats".to_string()),
                    pull: None,
                    poll_interval_ms: 0,
                    subscribe_message: Some("get_stats".to_string()),
                    shape: PayloadShape::Series,
                },
                FeedConfig {
                    feed_id: "server-health".to_string(),
                    push: None,
                    pull: Some("api/all-server-health".to_string()),
                    poll_interval_ms: 5000,
                    subscribe_message: None,
                    shape: PayloadShape::Rows,
                },
                FeedConfig {
                    feed_id: "attack-logs".to_string(),
                    push: Some("api/get-attack-logs".to_string()),
                    pull: Some("api/get-attack-logs".to_string()),
                    poll_interval_ms: 5000,
                    subscribe_message: Some("get_attack_logs".to_string()),
                    shape: PayloadShape::Any,
                },
            ],
        }
    }
}

impl DashboardConfig {
    /// Applies one override layer on top of `self`.
    pub fn apply(self, o: ConfigOverrides) -> Self {
        let reconnect_base_delay_ms = o.reconnect_base_delay_ms.unwrap_or(self.reconnect_base_delay_ms);
        Self {
            api_base_url: o.api_base_url.unwrap_or(self.api_base_url),
            ws_base_url: o.ws_base_url.unwrap_or(self.ws_base_url),
            auth_token: o.auth_token.or(self.auth_token),
            reconnect_base_delay_ms,
            // An unset cap follows a raised base delay.
            reconnect_max_delay_ms: o
                .reconnect_max_delay_ms
                .unwrap_or(self.reconnect_max_delay_ms.max(reconnect_base_delay_ms)),
            reconnect_max_retries: o.reconnect_max_retries.or(self.reconnect_max_retries),
            idle_timeout_secs: o.idle_timeout_secs.or(self.idle_timeout_secs),
            http_retries: o.http_retries.unwrap_or(self.http_retries),
            mutation_retries: o.mutation_retries.unwrap_or(self.mutation_retries),
            feeds: o.feeds.unwrap_or(self.feeds),
        }
    }

    /// Defaults, then the config file, then the environment, then `cli`.
    ///
    /// `path` wins over `FEEDSYNC_CONFIG_PATH`. A missing file is only an error
    /// when it was asked for explicitly.
    pub fn load(path: Option<&Path>, cli: ConfigOverrides) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", env_file.display());
        }

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let file_layer = match &explicit {
            Some(p) => ConfigOverrides::from_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    ConfigOverrides::from_file(default_path)?
                } else {
                    log::info!(
                        "Config file not found at {}. Using defaults and environment/CLI variables.",
                        default_path.display()
                    );
                    ConfigOverrides::default()
                }
            }
        };

        let overrides = file_layer.merge(ConfigOverrides::from_env()?).merge(cli);
        let config = Self::default().apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that could never produce a working feed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_base(&self.api_base_url, "apiBaseUrl")?;
        parse_base(&self.ws_base_url, "wsBaseUrl")?;

        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnectBaseDelayMs must be greater than 0".into()));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnectMaxDelayMs ({}) is lower than reconnectBaseDelayMs ({})",
                self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
            )));
        }

        let mut seen = HashSet::new();
        for fc in &self.feeds {
            if !seen.insert(fc.feed_id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate feed id '{}'", fc.feed_id)));
            }
            if fc.push.is_none() && fc.pull.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "feed '{}' has neither a push nor a pull endpoint",
                    fc.feed_id
                )));
            }
            if fc.push.is_none() && fc.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "feed '{}' is pull-only but pollIntervalMs is 0",
                    fc.feed_id
                )));
            }
            self.resolve(fc)?;
        }
        Ok(())
    }

    fn resolve(&self, fc: &FeedConfig) -> Result<Feed, ConfigError> {
        let mut feed = Feed::new(fc.feed_id.clone()).with_shape(fc.shape);
        if let Some(push) = &fc.push {
            let url = join(&self.ws_base_url, push, &["ws", "wss"], &fc.feed_id)?;
            feed = feed.with_push(url);
        }
        if let Some(pull) = &fc.pull {
            let url = join(&self.api_base_url, pull, &["http", "https"], &fc.feed_id)?;
            feed = feed.with_pull(url, fc.poll_interval_ms);
        }
        if let Some(msg) = &fc.subscribe_message {
            feed = feed.with_subscribe_message(msg.clone());
        }
        Ok(feed)
    }

    /// The configured feed `feed_id` with absolute endpoints.
    pub fn feed(&self, feed_id: &str) -> Result<Feed, ConfigError> {
        let fc = self
            .feeds
            .iter()
            .find(|f| f.feed_id == feed_id)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown feed '{}'", feed_id)))?;
        self.resolve(fc)
    }

    pub fn all_feeds(&self) -> Result<Vec<Feed>, ConfigError> {
        self.feeds.iter().map(|fc| self.resolve(fc)).collect()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_retries: self.reconnect_max_retries,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// WebSocket channels plus HTTP polling, wired with this configuration.
    pub fn network_transports(&self) -> Result<NetworkTransports, SyncError> {
        let client = ApiClient::new(&self.api_base_url, self.auth_token.clone(), self.http_retries)?;
        Ok(NetworkTransports::new(std::sync::Arc::new(HttpFetcher::new(client)))
            .with_reconnect(self.reconnect_policy())
            .with_idle_timeout(self.idle_timeout()))
    }

    pub fn dashboard_api(&self) -> Result<DashboardApi, SyncError> {
        let client = ApiClient::new(&self.api_base_url, self.auth_token.clone(), self.mutation_retries)?;
        Ok(DashboardApi::new(client))
    }
}

fn parse_base(base: &str, field: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(base).map_err(|e| ConfigError::Invalid(format!("{} '{}': {}", field, base, e)))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::Invalid(format!("{} '{}' cannot be a base URL", field, base)));
    }
    Ok(url)
}

fn join(base: &str, endpoint: &str, schemes: &[&str], feed_id: &str) -> Result<String, ConfigError> {
    let base = Url::parse(base).map_err(|e| ConfigError::Invalid(format!("'{}': {}", base, e)))?;
    let url = base
        .join(endpoint)
        .map_err(|e| ConfigError::Invalid(format!("feed '{}': endpoint '{}': {}", feed_id, endpoint, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "feed '{}': endpoint '{}' must use {}",
            feed_id,
            url,
            schemes.join(" or ")
        )));
    }
    Ok(url.to_string())
}
