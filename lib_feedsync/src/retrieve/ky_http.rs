//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous JSON API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries and standardized
//! response handling, and is shared by the poll sources and the dashboard
//! mutation API.

use reqwest::{header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE}, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::SyncError;

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Turns a non-2xx response into `SyncError::Request`.
    pub fn into_result(self) -> Result<Option<T>, SyncError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(SyncError::Request {
                status: Some(self.status),
                message: self.error_body.unwrap_or_default(),
            })
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// authentication tokens, and automatic retries.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "http://localhost:5000/").
    /// * `auth_token` - An optional string for the Authorization header.
    /// * `max_retries` - Transient-failure retries per request; `0` disables the middleware.
    ///
    /// # Errors
    /// Returns `SyncError::InvalidEndpoint` if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> Result<Self, SyncError> {
        let url = Url::parse(base_url)
            .map_err(|e| SyncError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;

        let mut builder = ClientBuilder::new(reqwest::Client::new());
        if max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
            auth_token,
        })
    }

    /// The base URL relative paths are joined against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn build<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<RequestBuilder> {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        Ok(req)
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// This method manages URL joining, header injection, authentication,
    /// and JSON serialization/deserialization. Absolute `path`s replace the
    /// base URL entirely.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, network execution or decoding
    /// of a 2xx body fails.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let response: reqwest::Response = self.build(method, path, headers, body)?.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();

        if success {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Capture the error body as a string for debugging
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Like `call`, but ignores the body of a successful response. Used for
    /// mutations that may answer `204 No Content`.
    pub async fn execute<B: Serialize>(&self, method: Method, path: &str, body: Option<B>) -> Result<ApiResponse<()>, SyncError> {
        let response = self
            .build(method, path, None, body)
            .map_err(classify_error)?
            .send()
            .await
            .map_err(|e| SyncError::request(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let error_body = if status.is_success() {
            None
        } else {
            response.text().await.ok()
        };
        Ok(ApiResponse {
            data: status.is_success().then_some(()),
            error_body,
            status: status.as_u16(),
            success: status.is_success(),
            headers,
        })
    }

    /// `request` with the error mapped into the feed taxonomy: undecodable
    /// 2xx bodies become `SchemaMismatch`, everything else `Request`.
    pub async fn call<T, B>(&self, method: Method, path: &str, body: Option<B>) -> Result<ApiResponse<T>, SyncError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.request::<T, B>(method, path, None, body)
            .await
            .map_err(classify_error)
    }
}

fn classify_error(err: anyhow::Error) -> SyncError {
    let is_decode = err
        .downcast_ref::<reqwest::Error>()
        .is_some_and(reqwest::Error::is_decode);
    if is_decode {
        SyncError::SchemaMismatch(format!("response body is not valid JSON: {}", err))
    } else {
        SyncError::request(err.to_string())
    }
}
