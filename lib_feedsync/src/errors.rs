//! # Error Taxonomy
//!
//! Every failure in the synchronization layer degrades to a visible status plus
//! continued retry. These variants describe what went wrong; none of them is
//! fatal to the process.

use thiserror::Error;

/// Errors surfaced by channels, poll sources, the synchronizer and the
/// dashboard API.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Push transport failed to open or broke while reading.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A pull request failed. `status` is set for non-2xx responses.
    #[error("Request failed{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Request {
        /// The HTTP status code, when a response was received at all.
        status: Option<u16>,
        /// Error body or transport error text.
        message: String,
    },

    /// The payload did not match the shape the feed expects.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// An endpoint could not be parsed or joined against its base URL.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Caller-supplied value rejected before any request was made.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Feed or client configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Builds a `Request` error from a transport-level failure.
    pub fn request(message: impl Into<String>) -> Self {
        SyncError::Request {
            status: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_display_includes_status() {
        let err = SyncError::Request {
            status: Some(503),
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "Request failed (503): unavailable");

        let err = SyncError::request("connection refused");
        assert_eq!(err.to_string(), "Request failed: connection refused");
    }
}
