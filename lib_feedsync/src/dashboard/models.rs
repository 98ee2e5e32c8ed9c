//! Typed views of the payloads the security dashboard backend serves.
//!
//! Feed payloads stay opaque `serde_json::Value`s inside the synchronizer; these
//! types are what a rendering layer decodes them into. Every `from_state`
//! function maps decode failures to `SyncError::SchemaMismatch` and treats a
//! feed without data as empty.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::feed::FeedState;
use crate::errors::SyncError;

/// Chart categories used when the backend has not sent any yet.
pub const DEFAULT_ATTACK_LABELS: [&str; 6] = ["SQLi", "XSS", "DDoS", "Brute Force", "Port Scan", "Malware"];

fn decode_value<T: DeserializeOwned>(value: &Value) -> Result<T, SyncError> {
    T::deserialize(value).map_err(|e| SyncError::SchemaMismatch(e.to_string()))
}

fn decode_state<T: DeserializeOwned>(state: &FeedState) -> Result<Option<T>, SyncError> {
    state
        .last_update
        .as_ref()
        .map(|update| decode_value(update.payload.as_ref()))
        .transpose()
}

// --- Stats ---

/// `{ "labels": [...], "data": [...] }`, the bar chart payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSeries {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

impl Default for StatsSeries {
    fn default() -> Self {
        Self {
            labels: DEFAULT_ATTACK_LABELS.iter().map(|l| l.to_string()).collect(),
            data: vec![0.0; DEFAULT_ATTACK_LABELS.len()],
        }
    }
}

impl StatsSeries {
    /// Label/value pairs; extra labels or values on either side are ignored.
    pub fn points(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.labels.iter().map(String::as_str).zip(self.data.iter().copied())
    }

    pub fn total(&self) -> f64 {
        self.data.iter().sum()
    }

    /// The series in `state`, or the zeroed default chart when there is none.
    pub fn from_state(state: &FeedState) -> Result<Self, SyncError> {
        Ok(decode_state(state)?.unwrap_or_default())
    }
}

/// Colour class of a stat card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    Danger,
    Warning,
    Success,
    Info,
}

/// One headline number on the dashboard ("ATTACKS BLOCKED", "UPTIME", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatCard {
    pub title: String,
    pub value: String,
    #[serde(default)]
    pub change: String,
    #[serde(rename = "type")]
    pub kind: CardKind,
    #[serde(default)]
    pub is_positive: bool,
}

impl StatCard {
    pub fn from_state(state: &FeedState) -> Result<Vec<Self>, SyncError> {
        Ok(decode_state(state)?.unwrap_or_default())
    }
}

// --- Server health ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthClass {
    Healthy,
    Warning,
    Critical,
}

impl HealthClass {
    /// `>= 90` healthy, `>= 70` warning, anything lower critical.
    pub fn classify(value: f64) -> Self {
        if value >= 90.0 {
            HealthClass::Healthy
        } else if value >= 70.0 {
            HealthClass::Warning
        } else {
            HealthClass::Critical
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            HealthClass::Healthy => "server-healthy",
            HealthClass::Warning => "server-warning",
            HealthClass::Critical => "server-critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHealth {
    #[serde(default)]
    pub name: String,
    /// Overall health score in percent.
    #[serde(default)]
    pub status: f64,
    pub cpu: f64,
    pub ram: f64,
}

impl ServerHealth {
    pub fn class(&self) -> HealthClass {
        HealthClass::classify(self.status)
    }

    /// Accepts the all-servers array as well as a single-server object.
    pub fn list_from_value(value: &Value) -> Result<Vec<Self>, SyncError> {
        match value {
            Value::Array(_) => decode_value(value),
            Value::Object(_) => Ok(vec![decode_value(value)?]),
            other => Err(SyncError::SchemaMismatch(format!("unexpected server health payload: {}", other))),
        }
    }

    pub fn from_state(state: &FeedState) -> Result<Vec<Self>, SyncError> {
        match &state.last_update {
            Some(update) => Self::list_from_value(&update.payload),
            None => Ok(Vec::new()),
        }
    }
}

// --- Attack logs ---

/// Severity as reported by the backend. Parsing is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Other(String),
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Other(value),
        }
    }
}

impl From<Severity> for String {
    fn from(value: Severity) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => f.write_str("Critical"),
            Severity::High => f.write_str("High"),
            Severity::Medium => f.write_str("Medium"),
            Severity::Low => f.write_str("Low"),
            Severity::Other(s) => f.write_str(s),
        }
    }
}

impl Severity {
    /// Badge colour used by the log tables.
    pub fn badge_class(&self) -> &'static str {
        match self {
            Severity::Critical => "badge-danger",
            Severity::High => "badge-warning",
            Severity::Medium => "badge-info",
            _ => "badge-success",
        }
    }
}

/// One detected attack, as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type")]
    pub attack_type: String,
    #[serde(alias = "sourceIp")]
    pub source_ip: String,
    pub target: String,
    pub severity: Severity,
    pub action: String,
}

/// Body for creating or replacing an attack record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttackLog {
    #[serde(rename = "type")]
    pub attack_type: String,
    pub source_ip: String,
    pub target: String,
    pub severity: Severity,
    pub action: String,
}

/// Incremental change pushed over the attack-log socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttackLogEvent {
    NewLog { log: AttackLog },
    DeletedLog {
        #[serde(rename = "logId")]
        log_id: i64,
    },
}

/// Newest-first list of attack logs maintained from a mixed push/pull feed.
///
/// Pulled arrays replace the whole list; pushed events are applied on top of
/// it in arrival order.
#[derive(Debug, Clone, Default)]
pub struct AttackLogBook {
    logs: Vec<AttackLog>,
    last_sequence: Option<u64>,
}

impl AttackLogBook {
    pub fn logs(&self) -> &[AttackLog] {
        &self.logs
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn apply(&mut self, event: AttackLogEvent) {
        match event {
            AttackLogEvent::NewLog { log } => self.logs.insert(0, log),
            AttackLogEvent::DeletedLog { log_id } => self.logs.retain(|l| l.id != Some(log_id)),
        }
    }

    pub fn apply_value(&mut self, value: &Value) -> Result<(), SyncError> {
        if value.is_array() {
            self.logs = decode_value(value)?;
        } else {
            self.apply(decode_value(value)?);
        }
        Ok(())
    }

    /// Folds in the feed's latest update if it has not been seen yet. Returns
    /// whether the book changed.
    pub fn observe(&mut self, state: &FeedState) -> Result<bool, SyncError> {
        let Some(update) = &state.last_update else {
            return Ok(false);
        };
        if self.last_sequence.is_some_and(|seq| update.sequence <= seq) {
            return Ok(false);
        }
        self.last_sequence = Some(update.sequence);
        self.apply_value(&update.payload)?;
        Ok(true)
    }
}

// --- IP blocking ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedIp {
    pub ip: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, alias = "blocked_at")]
    pub blocked_at: String,
}

/// Backend reply to `ipblock/block` and `ipblock/unblock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpBlockResponse {
    pub status: String,
    pub ip: String,
}

/// Newest-first local list of blocked addresses.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    entries: Vec<BlockedIp>,
}

impl BlockList {
    pub const MANUAL_REASON: &'static str = "Manual Block";

    pub fn from_state(state: &FeedState) -> Result<Self, SyncError> {
        Ok(Self {
            entries: decode_state(state)?.unwrap_or_default(),
        })
    }

    pub fn entries(&self) -> &[BlockedIp] {
        &self.entries
    }

    pub fn contains(&self, ip: &str) -> bool {
        let ip = canonical_ip(ip);
        self.entries.iter().any(|e| canonical_ip(&e.ip) == ip)
    }

    /// Adds `ip` at the front. Already blocked addresses are left where they are.
    pub fn block(&mut self, ip: &str, reason: Option<&str>) -> Result<&BlockedIp, SyncError> {
        let ip = parse_ip(ip)?;
        if let Some(idx) = self.entries.iter().position(|e| canonical_ip(&e.ip) == ip) {
            return Ok(&self.entries[idx]);
        }
        self.entries.insert(
            0,
            BlockedIp {
                ip,
                reason: reason.unwrap_or(Self::MANUAL_REASON).to_string(),
                blocked_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            },
        );
        Ok(&self.entries[0])
    }

    /// Returns whether an entry was removed.
    pub fn unblock(&mut self, ip: &str) -> bool {
        let ip = canonical_ip(ip);
        let before = self.entries.len();
        self.entries.retain(|e| canonical_ip(&e.ip) != ip);
        self.entries.len() != before
    }
}

/// Canonical text of `ip` for comparisons; unparsable input is only trimmed.
fn canonical_ip(ip: &str) -> String {
    parse_ip(ip).unwrap_or_else(|_| ip.trim().to_string())
}

/// Trims and validates an IPv4 or IPv6 address.
pub fn parse_ip(ip: &str) -> Result<String, SyncError> {
    let ip = ip.trim();
    if ip.is_empty() {
        return Err(SyncError::InvalidInput("IP address is empty".into()));
    }
    ip.parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| SyncError::InvalidInput(format!("'{}' is not a valid IP address", ip)))
}

// --- Alert preferences ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NotificationChannel {
    Email,
    #[serde(rename = "SMS")]
    Sms,
    #[serde(rename = "In-App")]
    InApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertFrequency {
    #[serde(rename = "Real-Time")]
    RealTime,
    Hourly,
    Daily,
}

/// Which attacks raise an alert, and how the user hears about them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPreferences {
    pub notification_type: NotificationChannel,
    pub severities: BTreeSet<Severity>,
    pub frequency: AlertFrequency,
    pub channels: BTreeSet<NotificationChannel>,
}

impl Default for AlertPreferences {
    fn default() -> Self {
        Self {
            notification_type: NotificationChannel::Email,
            severities: BTreeSet::from([Severity::Critical]),
            frequency: AlertFrequency::RealTime,
            channels: BTreeSet::from([NotificationChannel::Email]),
        }
    }
}

impl AlertPreferences {
    /// Flips one severity checkbox; returns whether it is now selected.
    pub fn toggle_severity(&mut self, severity: Severity) -> bool {
        if self.severities.remove(&severity) {
            false
        } else {
            self.severities.insert(severity);
            true
        }
    }

    pub fn toggle_channel(&mut self, channel: NotificationChannel) -> bool {
        if self.channels.remove(&channel) {
            false
        } else {
            self.channels.insert(channel);
            true
        }
    }

    pub fn should_alert(&self, log: &AttackLog) -> bool {
        !self.channels.is_empty() && self.severities.contains(&log.severity)
    }
}
