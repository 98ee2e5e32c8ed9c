//! # Feed Data Model
//!
//! The types that flow through the synchronization layer: the static description
//! of a feed, the updates it produces and the authoritative `FeedState` that
//! subscribers observe.
//!
//! ## Invariants enforced here:
//! - **Monotonic sequences**: `FeedState::apply_update` rejects any update whose
//!   `sequence` is not strictly greater than the last accepted one, and counts it.
//! - **Status machine**: `FeedState::apply_status` only performs transitions
//!   allowed by `ConnectionStatus::can_transition_to`. `Disconnected` is terminal.
//! - **Last known good**: errors never clear `last_update`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SyncError;

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    /// Delivered unsolicited over the push channel.
    Push,
    /// Returned by a poll request.
    Pull,
}

/// Undecoded inbound payload as handed over by a transport.
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// A text frame from the push channel.
    Text(String),
    /// An already-parsed HTTP body.
    Json(Value),
}

/// The structural expectation a feed places on its payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadShape {
    /// Any JSON value is accepted.
    #[default]
    Any,
    /// A JSON object.
    Object,
    /// A JSON array of objects (table rows).
    Rows,
    /// `{ "labels": [string...], "data": [number...] }` with equal lengths.
    Series,
}

impl PayloadShape {
    /// Checks `value` against this shape.
    pub fn check(&self, value: &Value) -> Result<(), SyncError> {
        match self {
            PayloadShape::Any => Ok(()),
            PayloadShape::Object => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(SyncError::SchemaMismatch(format!("expected an object, got {}", kind_of(value))))
                }
            }
            PayloadShape::Rows => {
                let rows = value.as_array().ok_or_else(|| {
                    SyncError::SchemaMismatch(format!("expected an array of rows, got {}", kind_of(value)))
                })?;
                match rows.iter().position(|row| !row.is_object()) {
                    Some(idx) => Err(SyncError::SchemaMismatch(format!("row {} is not an object", idx))),
                    None => Ok(()),
                }
            }
            PayloadShape::Series => {
                let labels = value
                    .get("labels")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SyncError::SchemaMismatch("missing 'labels' array".into()))?;
                let data = value
                    .get("data")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SyncError::SchemaMismatch("missing 'data' array".into()))?;
                if labels.len() != data.len() {
                    return Err(SyncError::SchemaMismatch(format!(
                        "{} labels but {} data points",
                        labels.len(),
                        data.len()
                    )));
                }
                if !labels.iter().all(Value::is_string) {
                    return Err(SyncError::SchemaMismatch("labels must be strings".into()));
                }
                if !data.iter().all(Value::is_number) {
                    return Err(SyncError::SchemaMismatch("data points must be numbers".into()));
                }
                Ok(())
            }
        }
    }

    /// Parses (if needed) and validates a raw payload.
    pub fn decode(&self, raw: RawPayload) -> Result<Value, SyncError> {
        let value = match raw {
            RawPayload::Json(v) => v,
            RawPayload::Text(text) => serde_json::from_str(&text)
                .map_err(|e| SyncError::SchemaMismatch(format!("payload is not JSON: {}", e)))?,
        };
        self.check(&value)?;
        Ok(value)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// # Feed
///
/// Identifies one logical metric stream and how to reach it. A feed may have a
/// push endpoint, a pull endpoint, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Unique per synchronizer instance.
    pub feed_id: String,
    /// WebSocket URI for push updates.
    pub endpoint_push: Option<String>,
    /// HTTP URI polled with `GET`.
    pub endpoint_pull: Option<String>,
    /// Poll period in milliseconds; `0` disables polling.
    pub poll_interval_ms: u64,
    /// Control message sent after every successful push (re)connect.
    pub subscribe_message: Option<String>,
    /// Expected payload structure.
    pub shape: PayloadShape,
}

impl Feed {
    /// A feed with no endpoints yet.
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            endpoint_push: None,
            endpoint_pull: None,
            poll_interval_ms: 0,
            subscribe_message: None,
            shape: PayloadShape::Any,
        }
    }

    pub fn with_push(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_push = Some(endpoint.into());
        self
    }

    pub fn with_pull(mut self, endpoint: impl Into<String>, interval_ms: u64) -> Self {
        self.endpoint_pull = Some(endpoint.into());
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_subscribe_message(mut self, message: impl Into<String>) -> Self {
        self.subscribe_message = Some(message.into());
        self
    }

    pub fn with_shape(mut self, shape: PayloadShape) -> Self {
        self.shape = shape;
        self
    }

    /// True when a pull endpoint is set and the interval is non-zero.
    pub fn polling_enabled(&self) -> bool {
        self.endpoint_pull.is_some() && self.poll_interval_ms > 0
    }

    /// True when a push endpoint is set.
    pub fn pushing_enabled(&self) -> bool {
        self.endpoint_push.is_some()
    }
}

/// One accepted (or candidate) inbound payload.
#[derive(Debug, Clone)]
pub struct Update {
    pub source: UpdateSource,
    /// Monotonic arrival time.
    pub received_at: Instant,
    /// Assigned on arrival, strictly increasing per feed.
    pub sequence: u64,
    /// Shared so that snapshots clone cheaply.
    pub payload: Arc<Value>,
}

impl Update {
    pub fn new(source: UpdateSource, sequence: u64, payload: Value) -> Self {
        Self {
            source,
            received_at: Instant::now(),
            sequence,
            payload: Arc::new(payload),
        }
    }
}

/// Connection health as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Owner-initiated close. Terminal.
    Disconnected,
    /// A status report, still eligible for the next scheduled retry.
    Failed,
}

impl ConnectionStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Failed)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Failed)
                | (Failed, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result of offering an update to a `FeedState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted,
    /// Sequence not newer than the current one; dropped and counted.
    StaleUpdateDiscarded,
}

/// # Feed State
///
/// The authoritative view of one feed. Subscribers receive it behind an `Arc`
/// and must treat it as immutable.
#[derive(Debug, Clone)]
pub struct FeedState {
    pub feed_id: String,
    pub last_update: Option<Update>,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    /// Number of live subscriptions on the feed when the snapshot was taken.
    pub subscriber_count: usize,
    /// Bumped on every observable change.
    pub revision: u64,
    pub stale_discarded: u64,
    pub schema_mismatches: u64,
}

impl FeedState {
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            last_update: None,
            connection_status: ConnectionStatus::Connecting,
            last_error: None,
            subscriber_count: 0,
            revision: 0,
            stale_discarded: 0,
            schema_mismatches: 0,
        }
    }

    /// Sequence of the last accepted update, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_update.as_ref().map(|u| u.sequence)
    }

    /// Offers an update; only strictly newer sequences are accepted.
    pub fn apply_update(&mut self, update: Update) -> ApplyOutcome {
        if let Some(last) = self.last_sequence() {
            if update.sequence <= last {
                self.stale_discarded += 1;
                return ApplyOutcome::StaleUpdateDiscarded;
            }
        }
        self.last_update = Some(update);
        // A good payload supersedes data errors, but not a failed transport.
        if self.connection_status != ConnectionStatus::Failed {
            self.last_error = None;
        }
        self.revision += 1;
        ApplyOutcome::Accepted
    }

    /// Applies a status transition. Returns `false` (and changes nothing) for
    /// illegal or no-op transitions.
    pub fn apply_status(&mut self, next: ConnectionStatus, error: Option<String>) -> bool {
        let current = self.connection_status;
        if current == next && next != ConnectionStatus::Failed {
            return false;
        }
        if !current.can_transition_to(next) {
            log::debug!(
                "Feed '{}': ignoring illegal status transition {} -> {}",
                self.feed_id,
                current,
                next
            );
            return false;
        }
        self.connection_status = next;
        match next {
            ConnectionStatus::Failed => {
                self.last_error = Some(error.unwrap_or_else(|| "connection failed".to_string()));
            }
            ConnectionStatus::Connected => self.last_error = None,
            _ => {}
        }
        self.revision += 1;
        true
    }

    /// Records a non-transport error without touching the last good update.
    pub fn record_error(&mut self, error: &SyncError) {
        if matches!(error, SyncError::SchemaMismatch(_)) {
            self.schema_mismatches += 1;
        }
        self.last_error = Some(error.to_string());
        self.revision += 1;
    }

    /// Decodes the last payload into `T`, if there is one.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        match &self.last_update {
            Some(update) => Ok(Some(T::deserialize(update.payload.as_ref())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(seq: u64) -> Update {
        Update::new(UpdateSource::Push, seq, json!({ "seq": seq }))
    }

    #[test]
    fn test_older_sequence_is_discarded() {
        let mut state = FeedState::new("attack-stats");
        assert_eq!(state.apply_update(update(5)), ApplyOutcome::Accepted);
        assert_eq!(state.apply_update(update(3)), ApplyOutcome::StaleUpdateDiscarded);
        assert_eq!(state.last_sequence(), Some(5));
        assert_eq!(state.stale_discarded, 1);
    }

    #[test]
    fn test_equal_sequence_is_discarded() {
        let mut state = FeedState::new("f");
        state.apply_update(update(2));
        assert_eq!(state.apply_update(update(2)), ApplyOutcome::StaleUpdateDiscarded);
    }

    #[test]
    fn test_last_update_tracks_highest_sequence_for_any_order() {
        let orders: [&[u64]; 4] = [&[1, 2, 3, 4], &[4, 3, 2, 1], &[2, 9, 1, 7, 3], &[5, 5, 6, 1, 6]];
        for order in orders {
            let mut state = FeedState::new("f");
            let mut max_seen = 0;
            for &seq in order {
                state.apply_update(update(seq));
                max_seen = max_seen.max(seq);
                assert_eq!(state.last_sequence(), Some(max_seen));
                assert_eq!(state.last_update.as_ref().unwrap().payload["seq"], json!(max_seen));
            }
        }
    }

    #[test]
    fn test_status_machine() {
        let mut state = FeedState::new("f");
        assert!(state.apply_status(ConnectionStatus::Connected, None));
        assert!(!state.apply_status(ConnectionStatus::Connecting, None));
        assert!(state.apply_status(ConnectionStatus::Failed, Some("reset by peer".into())));
        assert_eq!(state.last_error.as_deref(), Some("reset by peer"));
        assert!(state.apply_status(ConnectionStatus::Connecting, None));
        assert!(state.apply_status(ConnectionStatus::Connected, None));
        assert_eq!(state.last_error, None);
        assert!(state.apply_status(ConnectionStatus::Disconnected, None));
        assert!(!state.apply_status(ConnectionStatus::Connecting, None));
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_errors_keep_last_known_good() {
        let mut state = FeedState::new("f");
        state.apply_update(update(1));
        state.record_error(&SyncError::SchemaMismatch("bad".into()));
        assert_eq!(state.last_sequence(), Some(1));
        assert_eq!(state.schema_mismatches, 1);
        assert!(state.last_error.is_some());
        state.apply_update(update(2));
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_shapes() {
        assert!(PayloadShape::Series.check(&json!({"labels": ["SQLi", "XSS"], "data": [45, 32]})).is_ok());
        assert!(PayloadShape::Series.check(&json!({"labels": ["SQLi"], "data": [45, 32]})).is_err());
        assert!(PayloadShape::Series.check(&json!({"labels": [1], "data": [2]})).is_err());
        assert!(PayloadShape::Rows.check(&json!([{"name": "s1"}, {"name": "s2"}])).is_ok());
        assert!(PayloadShape::Rows.check(&json!([{"name": "s1"}, 3])).is_err());
        assert!(PayloadShape::Object.check(&json!([])).is_err());
        assert!(PayloadShape::Any.check(&json!(null)).is_ok());
    }

    #[test]
    fn test_decode_rejects_non_json_text() {
        let err = PayloadShape::Any.decode(RawPayload::Text("not json".into())).unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch(_)));
        let ok = PayloadShape::Object.decode(RawPayload::Text(r#"{"cpu": 12}"#.into())).unwrap();
        assert_eq!(ok["cpu"], json!(12));
    }
}
