//! # Transport Channel
//!
//! A resilient WebSocket client for one push endpoint. The channel owns its
//! connect/reconnect/close lifecycle and reports every status transition to its
//! owner through `on_status`; inbound text frames are handed over raw through
//! `on_update`.
//!
//! ## Lifecycle:
//! - Starts in `Connecting`. A successful handshake reports `Connected` and sends
//!   the configured subscribe message.
//! - Any read error, remote close or idle timeout reports `Failed` with the
//!   reason, waits for the backoff delay, reports `Connecting` and tries again.
//!   Only the single channel task schedules retries, so reconnects never stack.
//! - `close()` reports `Disconnected` and is terminal. No new frame or status is
//!   picked up after it returns; on a multi-threaded runtime a callback that
//!   already passed the closed check on another thread may still finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

use crate::core::feed::{ConnectionStatus, RawPayload};
use crate::core::lock;
use crate::ingestors::transports::{PushLink, StatusFn, UpdateFn};

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay.max(self.base_delay))
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures > max)
    }
}

/// Everything needed to open one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub subscribe_message: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// A connection silent for longer than this is treated as dropped.
    pub idle_timeout: Option<Duration>,
}

struct ChannelShared {
    endpoint: String,
    status: Mutex<ConnectionStatus>,
    closed: AtomicBool,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    on_status: StatusFn,
}

impl ChannelShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    /// Records and reports a transition unless the owner already closed.
    fn emit(&self, status: ConnectionStatus, error: Option<String>) {
        if self.is_closed() {
            return;
        }
        *lock(&self.status) = status;
        (self.on_status)(status, error);
    }
}

/// Entry point for opening push channels.
pub struct TransportChannel;

impl TransportChannel {
    /// Spawns the channel task and returns the owner's handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: ChannelConfig, on_update: UpdateFn, on_status: StatusFn) -> ChannelHandle {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            endpoint: config.endpoint.clone(),
            status: Mutex::new(ConnectionStatus::Connecting),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            outbound,
            on_status,
        });

        tokio::spawn(run(Arc::clone(&shared), config, on_update, outbound_rx));

        ChannelHandle { shared }
    }
}

/// Owner handle of an open channel. Dropping it closes the channel.
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Releases the connection. Calling it again is a no-op.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        *lock(&self.shared.status) = ConnectionStatus::Disconnected;
        log::info!("Push channel to {} closed by owner.", self.shared.endpoint);
        (self.shared.on_status)(ConnectionStatus::Disconnected, None);
    }

    /// Queues a control message. Dropped (and logged) unless `Connected`.
    pub fn send(&self, message: &str) {
        let status = self.shared.status();
        if self.shared.is_closed() || status != ConnectionStatus::Connected {
            log::warn!(
                "Dropping control message for {}: channel is {}.",
                self.shared.endpoint,
                status
            );
            return;
        }
        if self.shared.outbound.send(message.to_string()).is_err() {
            log::warn!("Dropping control message for {}: channel task has stopped.", self.shared.endpoint);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl PushLink for ChannelHandle {
    fn close(&self) {
        ChannelHandle::close(self);
    }

    fn send(&self, message: &str) {
        ChannelHandle::send(self, message);
    }
}

/// Channel task: connect, read until the connection breaks, back off, repeat.
async fn run(
    shared: Arc<ChannelShared>,
    config: ChannelConfig,
    on_update: UpdateFn,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut failures: u32 = 0;

    loop {
        log::info!("Connecting to push endpoint: {}", config.endpoint);

        let attempt = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            res = connect_async(config.endpoint.as_str()) => res,
        };

        let reason = match attempt {
            Ok((ws_stream, _)) => {
                log::info!("Connected to {}", config.endpoint);
                failures = 0;
                shared.emit(ConnectionStatus::Connected, None);

                let (mut write, mut read) = ws_stream.split();

                if let Some(msg) = &config.subscribe_message {
                    log::debug!("Sending subscribe message to {}: {}", config.endpoint, msg);
                    if let Err(e) = write.send(Message::Text(msg.clone().into())).await {
                        log::warn!("Failed to send subscribe message to {}: {}", config.endpoint, e);
                    }
                }

                let mut last_activity = Instant::now();

                loop {
                    let idle_at = config.idle_timeout.map(|timeout| last_activity + timeout);
                    let idle_deadline = async move {
                        match idle_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    };

                    tokio::select! {
                        _ = shared.cancel.cancelled() => {
                            let _ = write.close().await;
                            return;
                        }
                        Some(out) = outbound_rx.recv() => {
                            log::debug!("Sending control message to {}: {}", config.endpoint, out);
                            if let Err(e) = write.send(Message::Text(out.into())).await {
                                break format!("send failed: {}", e);
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    last_activity = Instant::now();
                                    if !shared.is_closed() {
                                        on_update(RawPayload::Text(text.as_str().to_owned()));
                                    }
                                }
                                Some(Ok(Message::Binary(bin))) => {
                                    last_activity = Instant::now();
                                    match String::from_utf8(bin.to_vec()) {
                                        Ok(text) if !shared.is_closed() => on_update(RawPayload::Text(text)),
                                        Ok(_) => {}
                                        Err(_) => log::warn!("Ignoring non UTF-8 binary frame from {}", config.endpoint),
                                    }
                                }
                                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                    // Heartbeats count as activity so quiet feeds are not dropped.
                                    last_activity = Instant::now();
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    break match frame {
                                        Some(f) => format!("closed by remote host (code {}): {}", u16::from(f.code), f.reason.as_str()),
                                        None => "closed by remote host".to_string(),
                                    };
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::error!("Read error on {}: {}", config.endpoint, e);
                                    break format!("read error: {}", e);
                                }
                                None => {
                                    log::warn!("Stream {} closed by remote host.", config.endpoint);
                                    break "stream closed by remote host".to_string();
                                }
                            }
                        }
                        _ = idle_deadline => {
                            let secs = config.idle_timeout.map(|d| d.as_secs_f64()).unwrap_or_default();
                            log::warn!("Inactivity timeout ({:.1}s) on {}. Reconnecting...", secs, config.endpoint);
                            break format!("no traffic for {:.1}s", secs);
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to connect to {}: {}", config.endpoint, e);
                format!("connect failed: {}", e)
            }
        };

        if shared.is_closed() {
            return;
        }

        failures += 1;
        if config.reconnect.exhausted(failures) {
            log::error!(
                "Giving up on {} after {} consecutive failures.",
                config.endpoint,
                failures
            );
            shared.emit(
                ConnectionStatus::Failed,
                Some(format!("{}; giving up after {} attempts", reason, failures)),
            );
            return;
        }

        shared.emit(ConnectionStatus::Failed, Some(reason));

        let delay = config.reconnect.delay_for(failures);
        log::info!("Reconnecting to {} in {:?}...", config.endpoint, delay);
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        shared.emit(ConnectionStatus::Connecting, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    #[derive(Debug, PartialEq)]
    enum Event {
        Update(String),
        Status(ConnectionStatus),
    }

    fn recorder() -> (UpdateFn, StatusFn, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx_status = tx.clone();
        let on_update: UpdateFn = Arc::new(move |raw| {
            if let RawPayload::Text(text) = raw {
                let _ = tx.send(Event::Update(text));
            }
        });
        let on_status: StatusFn = Arc::new(move |status, _| {
            let _ = tx_status.send(Event::Status(status));
        });
        (on_update, on_status, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event channel closed")
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_retries: None,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_retries: None,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(400), Duration::from_secs(5));
        assert_eq!(ReconnectPolicy::default().delay_for(7), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_subscribe_message_updates_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/stats", listener.local_addr().unwrap());

        let (control_tx, control_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first, Message::Text("get_stats".into()));
            ws.send(Message::Text(r#"{"labels":["SQLi"],"data":[45]}"#.into())).await.unwrap();
            let control = ws.next().await.unwrap().unwrap();
            let _ = control_tx.send(control);
            // Keep the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (on_update, on_status, mut rx) = recorder();
        let handle = TransportChannel::open(
            ChannelConfig {
                endpoint: url,
                subscribe_message: Some("get_stats".into()),
                reconnect: fast_policy(),
                idle_timeout: None,
            },
            on_update,
            on_status,
        );

        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connected));
        assert_eq!(
            next_event(&mut rx).await,
            Event::Update(r#"{"labels":["SQLi"],"data":[45]}"#.into())
        );

        handle.send("refresh");
        let control = timeout(Duration::from_secs(5), control_rx).await.unwrap().unwrap();
        assert_eq!(control, Message::Text("refresh".into()));

        handle.close();
        handle.close();
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Disconnected));
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);

        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no events after close");
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        tokio::spawn(async move {
            // First connection is dropped by the server right away.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text("{}".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (on_update, on_status, mut rx) = recorder();
        let handle = TransportChannel::open(
            ChannelConfig {
                endpoint: url,
                subscribe_message: None,
                reconnect: fast_policy(),
                idle_timeout: None,
            },
            on_update,
            on_status,
        );

        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connected));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Failed));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connecting));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connected));
        assert_eq!(next_event(&mut rx).await, Event::Update("{}".into()));
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_reconnects_within_one_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/stats", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
        });

        let (on_update, on_status, mut rx) = recorder();
        let handle = TransportChannel::open(
            ChannelConfig {
                endpoint: url,
                subscribe_message: None,
                reconnect: ReconnectPolicy::default(),
                idle_timeout: None,
            },
            on_update,
            on_status,
        );

        // No timeout wrappers: paused time would fire them while socket IO is pending.
        assert_eq!(rx.recv().await, Some(Event::Status(ConnectionStatus::Connected)));
        assert_eq!(rx.recv().await, Some(Event::Status(ConnectionStatus::Failed)));
        let failed_at = Instant::now();
        assert_eq!(rx.recv().await, Some(Event::Status(ConnectionStatus::Connecting)));
        let waited = failed_at.elapsed();
        assert!(waited <= Duration::from_secs(5), "reconnect took {:?}", waited);
        assert!(waited >= ReconnectPolicy::default().base_delay);
        handle.close();
    }

    #[tokio::test]
    async fn test_gives_up_with_failed_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let on_update: UpdateFn = Arc::new(|_| {});
        let on_status: StatusFn = Arc::new(move |status, error| {
            let _ = tx.send((status, error));
        });

        let handle = TransportChannel::open(
            ChannelConfig {
                endpoint: url,
                subscribe_message: None,
                reconnect: ReconnectPolicy {
                    max_retries: Some(1),
                    ..fast_policy()
                },
                idle_timeout: None,
            },
            on_update,
            on_status,
        );

        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(2), rx.recv()).await {
            seen.push(event);
        }
        let statuses: Vec<_> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Failed, ConnectionStatus::Connecting, ConnectionStatus::Failed]
        );
        assert!(seen[2].1.as_deref().unwrap_or_default().contains("giving up"));

        // Send while not connected is dropped without error.
        handle.send("get_stats");
    }

    #[tokio::test]
    async fn test_idle_timeout_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    // Silent server.
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let (on_update, on_status, mut rx) = recorder();
        let handle = TransportChannel::open(
            ChannelConfig {
                endpoint: url,
                subscribe_message: None,
                reconnect: fast_policy(),
                idle_timeout: Some(Duration::from_millis(100)),
            },
            on_update,
            on_status,
        );

        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connected));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Failed));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connecting));
        assert_eq!(next_event(&mut rx).await, Event::Status(ConnectionStatus::Connected));
        handle.close();
    }
}
