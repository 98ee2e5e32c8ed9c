//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the poll sources and the dashboard mutation API.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic JSON `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with optional exponential-backoff retries.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};
