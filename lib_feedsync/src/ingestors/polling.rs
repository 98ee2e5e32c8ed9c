//! # Poll Source
//!
//! A self-scheduling REST poller for one pull endpoint. It issues one request
//! immediately and then one per interval until stopped.
//!
//! ## Key Design Principles:
//! - **One request in flight**: a tick that fires while the previous request is
//!   still outstanding is skipped, so a slow backend never accumulates concurrent
//!   requests.
//! - **Resilience**: a failed request is reported through `on_error` and the timer
//!   keeps running; only `stop()` ends polling.
//! - **Stop without cancel**: `stop()` cancels the timer; a request already in
//!   flight is allowed to finish but its result is discarded. A result that was
//!   already being handed over on another thread when `stop()` ran may still be
//!   delivered once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::feed::RawPayload;
use crate::errors::SyncError;
use crate::ingestors::transports::{ErrorFn, PullLink, UpdateFn};
use crate::retrieve::ky_http::ApiClient;

/// Performs one pull request.
pub trait PullFetcher: Send + Sync {
    fn fetch<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Value, SyncError>>;
}

/// `GET <endpoint>` through the shared `ApiClient`; non-2xx is an error.
pub struct HttpFetcher {
    client: ApiClient,
}

impl HttpFetcher {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

impl PullFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Value, SyncError>> {
        Box::pin(async move {
            let response = self.client.call::<Value, ()>(Method::GET, endpoint, None).await?;
            response.into_result().map(Option::unwrap_or_default)
        })
    }
}

struct PollShared {
    endpoint: String,
    active: AtomicBool,
    in_flight: AtomicBool,
    cancel: CancellationToken,
    refresh: Notify,
    requests_issued: AtomicU64,
    ticks_skipped: AtomicU64,
}

/// Entry point for starting poll sources.
pub struct PollSource;

impl PollSource {
    /// Spawns the timer task. The first request goes out immediately.
    ///
    /// A zero `interval` means polling is disabled: the returned handle is
    /// already stopped and never issues a request.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        endpoint: String,
        interval: Duration,
        fetcher: Arc<dyn PullFetcher>,
        on_update: UpdateFn,
        on_error: ErrorFn,
    ) -> PollHandle {
        let shared = Arc::new(PollShared {
            endpoint,
            active: AtomicBool::new(!interval.is_zero()),
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            refresh: Notify::new(),
            requests_issued: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
        });

        if interval.is_zero() {
            log::warn!("Poll interval for {} is zero; polling disabled.", shared.endpoint);
            return PollHandle { shared };
        }

        tokio::spawn(run(Arc::clone(&shared), interval, fetcher, on_update, on_error));

        PollHandle { shared }
    }
}

/// Owner handle of a running poll source. Dropping it stops polling.
pub struct PollHandle {
    shared: Arc<PollShared>,
}

impl PollHandle {
    /// Cancels the timer. Calling it again is a no-op.
    pub fn stop(&self) {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        log::debug!("Poll source for {} stopped.", self.shared.endpoint);
    }

    /// Asks for an immediate request (still skipped if one is in flight).
    pub fn refresh(&self) {
        if self.is_active() {
            self.shared.refresh.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn requests_issued(&self) -> u64 {
        self.shared.requests_issued.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.shared.ticks_skipped.load(Ordering::Relaxed)
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PullLink for PollHandle {
    fn stop(&self) {
        PollHandle::stop(self);
    }

    fn refresh(&self) {
        PollHandle::refresh(self);
    }
}

async fn run(
    shared: Arc<PollShared>,
    interval: Duration,
    fetcher: Arc<dyn PullFetcher>,
    on_update: UpdateFn,
    on_error: ErrorFn,
) {
    log::info!("Polling {} every {:?}", shared.endpoint, interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = shared.refresh.notified() => {
                log::debug!("Out-of-band poll requested for {}", shared.endpoint);
            }
        }

        if shared.in_flight.swap(true, Ordering::AcqRel) {
            shared.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Skipping tick for {}: previous request still in flight.", shared.endpoint);
            continue;
        }

        shared.requests_issued.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&shared);
        let fetcher = Arc::clone(&fetcher);
        let on_update = Arc::clone(&on_update);
        let on_error = Arc::clone(&on_error);

        tokio::spawn(async move {
            let result = fetcher.fetch(&shared.endpoint).await;
            shared.in_flight.store(false, Ordering::Release);

            if !shared.active.load(Ordering::Acquire) {
                log::debug!("Discarding late response from stopped poll of {}", shared.endpoint);
                return;
            }

            match result {
                Ok(body) => on_update(RawPayload::Json(body)),
                Err(e) => {
                    log::warn!("Poll of {} failed: {}", shared.endpoint, e);
                    on_error(e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct SlowFetcher {
        delay: Duration,
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowFetcher {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PullFetcher for SlowFetcher {
        fn fetch<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, Result<Value, SyncError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    Err(SyncError::Request { status: Some(502), message: "bad gateway".into() })
                } else {
                    Ok(json!({ "call": n }))
                }
            })
        }
    }

    fn collectors() -> (UpdateFn, ErrorFn, Arc<Mutex<Vec<Value>>>, Arc<Mutex<Vec<String>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&updates);
        let e = Arc::clone(&errors);
        let on_update: UpdateFn = Arc::new(move |raw| {
            if let RawPayload::Json(v) = raw {
                u.lock().unwrap().push(v);
            }
        });
        let on_error: ErrorFn = Arc::new(move |err| e.lock().unwrap().push(err.to_string()));
        (on_update, on_error, updates, errors)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_skips_overlapping_tick() {
        let fetcher = SlowFetcher::new(7000, false);
        let (on_update, on_error, updates, _) = collectors();
        let handle = PollSource::start(
            "api/all-server-health".into(),
            Duration::from_millis(5000),
            fetcher.clone(),
            on_update,
            on_error,
        );

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(fetcher.calls(), 2, "tick at 5s must be skipped");
        assert_eq!(handle.ticks_skipped(), 1);
        assert_eq!(updates.lock().unwrap().len(), 1);

        // 15s tick overlaps the request started at 10s; 20s tick goes out.
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(fetcher.calls(), 3);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_returns_stopped_handle() {
        let fetcher = SlowFetcher::new(10, false);
        let (on_update, on_error, updates, errors) = collectors();
        let handle = PollSource::start(
            "api/stats".into(),
            Duration::ZERO,
            fetcher.clone(),
            on_update,
            on_error,
        );

        assert!(!handle.is_active());
        handle.refresh();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(handle.requests_issued(), 0);
        assert!(updates.lock().unwrap().is_empty());
        assert!(errors.lock().unwrap().is_empty());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_polling() {
        let fetcher = SlowFetcher::new(10, true);
        let (on_update, on_error, updates, errors) = collectors();
        let handle = PollSource::start(
            "api/stats".into(),
            Duration::from_millis(1000),
            fetcher.clone(),
            on_update,
            on_error,
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(errors.lock().unwrap().len(), 3);
        assert!(updates.lock().unwrap().is_empty());
        assert!(handle.is_active());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_result() {
        let fetcher = SlowFetcher::new(7000, false);
        let (on_update, on_error, updates, errors) = collectors();
        let handle = PollSource::start(
            "api/stats".into(),
            Duration::from_millis(5000),
            fetcher.clone(),
            on_update,
            on_error,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 1);
        handle.stop();
        handle.stop();

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(fetcher.calls(), 1);
        assert!(updates.lock().unwrap().is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_issues_immediate_request() {
        let fetcher = SlowFetcher::new(10, false);
        let (on_update, on_error, updates, _) = collectors();
        let handle = PollSource::start(
            "api/stats".into(),
            Duration::from_millis(60_000),
            fetcher.clone(),
            on_update,
            on_error,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 1);

        handle.refresh();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(updates.lock().unwrap().len(), 2);
        handle.stop();
    }

    /// Serves one canned HTTP response on a loopback port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "{}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn test_http_fetcher_success_and_failure() {
        let base = serve_once("HTTP/1.1 200 OK", r#"[{"name":"Server 1","cpu":91,"ram":40}]"#).await;
        let fetcher = HttpFetcher::new(ApiClient::new(&base, None, 0).unwrap());
        let body = fetcher.fetch("api/all-server-health").await.unwrap();
        assert_eq!(body[0]["name"], json!("Server 1"));

        let base = serve_once("HTTP/1.1 500 Internal Server Error", "oops").await;
        let fetcher = HttpFetcher::new(ApiClient::new(&base, None, 0).unwrap());
        match fetcher.fetch("api/all-server-health").await {
            Err(SyncError::Request { status, .. }) => assert_eq!(status, Some(500)),
            other => panic!("unexpected: {:?}", other),
        }

        let base = serve_once("HTTP/1.1 200 OK", "not json").await;
        let fetcher = HttpFetcher::new(ApiClient::new(&base, None, 0).unwrap());
        assert!(matches!(
            fetcher.fetch("api/stats").await,
            Err(SyncError::SchemaMismatch(_))
        ));
    }
}
