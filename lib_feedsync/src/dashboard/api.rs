//! Mutation endpoints of the dashboard backend.
//!
//! These calls are fire-and-refresh: nothing here touches feed state. After a
//! mutation succeeds, callers ask the synchronizer to `refresh` the affected
//! feed (or wait for the next push) to observe the result.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dashboard::models::{parse_ip, AttackLog, IpBlockResponse, NewAttackLog};
use crate::errors::SyncError;
use crate::retrieve::ky_http::ApiClient;

const ATTACKS: &str = "api/attacks";

#[derive(Clone)]
pub struct DashboardApi {
    client: ApiClient,
}

impl DashboardApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    async fn fetch<T, B>(&self, method: Method, path: &str, body: Option<B>) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.client
            .call::<T, B>(method, path, body)
            .await?
            .into_result()?
            .ok_or_else(|| SyncError::SchemaMismatch(format!("empty response from {}", path)))
    }

    async fn mutate(&self, method: Method, path: &str) -> Result<(), SyncError> {
        self.client.execute(method, path, None::<()>).await?.into_result()?;
        Ok(())
    }

    pub async fn list_attacks(&self) -> Result<Vec<AttackLog>, SyncError> {
        self.fetch(Method::GET, ATTACKS, None::<()>).await
    }

    pub async fn create_attack(&self, attack: &NewAttackLog) -> Result<AttackLog, SyncError> {
        let created: AttackLog = self.fetch(Method::POST, ATTACKS, Some(attack)).await?;
        log::info!("Created attack record {:?} ({}).", created.id, created.attack_type);
        Ok(created)
    }

    pub async fn update_attack(&self, id: i64, attack: &NewAttackLog) -> Result<AttackLog, SyncError> {
        self.fetch(Method::PUT, &format!("{}/{}", ATTACKS, id), Some(attack)).await
    }

    pub async fn delete_attack(&self, id: i64) -> Result<(), SyncError> {
        self.mutate(Method::DELETE, &format!("{}/{}", ATTACKS, id)).await?;
        log::info!("Deleted attack record {}.", id);
        Ok(())
    }

    /// Asks the backend to generate one sample attack log.
    pub async fn add_sample_log(&self) -> Result<(), SyncError> {
        self.mutate(Method::POST, "api/add-sample").await
    }

    pub async fn delete_attack_log(&self, id: i64) -> Result<(), SyncError> {
        self.mutate(Method::DELETE, &format!("api/attack-logs/{}", id)).await?;
        log::info!("Deleted attack log {}.", id);
        Ok(())
    }

    /// Blocks `ip` on the backend firewall. The address is validated locally
    /// first; malformed input never reaches the network.
    pub async fn block_ip(&self, ip: &str) -> Result<IpBlockResponse, SyncError> {
        let ip = parse_ip(ip)?;
        let resp: IpBlockResponse = self
            .fetch(Method::POST, &format!("api/ipblock/block?ip={}", ip), None::<()>)
            .await?;
        log::info!("Blocked {} ({}).", resp.ip, resp.status);
        Ok(resp)
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<IpBlockResponse, SyncError> {
        let ip = parse_ip(ip)?;
        let resp: IpBlockResponse = self
            .fetch(Method::POST, &format!("api/ipblock/unblock?ip={}", ip), None::<()>)
            .await?;
        log::info!("Unblocked {} ({}).", resp.ip, resp.status);
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::models::Severity;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Answers one request and hands back what the client sent.
    async fn capture_once(status_line: &'static str, body: &'static str) -> (DashboardApi, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
            let response = format!(
                "{}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
        });
        let api = DashboardApi::new(ApiClient::new(&base, None, 0).unwrap());
        (api, rx)
    }

    #[tokio::test]
    async fn test_block_ip_posts_query() {
        let (api, rx) = capture_once("HTTP/1.1 200 OK", r#"{"status":"blocked","ip":"10.0.0.7"}"#).await;
        let resp = api.block_ip(" 10.0.0.7 ").await.unwrap();
        assert_eq!(resp.status, "blocked");
        let sent = rx.await.unwrap();
        assert!(sent.starts_with("POST /api/ipblock/block?ip=10.0.0.7 HTTP/1.1"), "{}", sent);
    }

    #[tokio::test]
    async fn test_invalid_ip_never_hits_the_network() {
        let api = DashboardApi::new(ApiClient::new("http://127.0.0.1:9/", None, 0).unwrap());
        assert!(matches!(api.block_ip("not-an-ip").await, Err(SyncError::InvalidInput(_))));
        assert!(matches!(api.unblock_ip("").await, Err(SyncError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_attack_log_ignores_empty_body() {
        let (api, rx) = capture_once("HTTP/1.1 200 OK", "").await;
        api.delete_attack_log(17).await.unwrap();
        assert!(rx.await.unwrap().starts_with("DELETE /api/attack-logs/17 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_create_attack_round_trip() {
        let (api, rx) = capture_once(
            "HTTP/1.1 200 OK",
            r#"{"id":9,"timestamp":"2024-11-17T10:00:00","type":"XSS","source_ip":"78.90.123.45","target":"Web Server","severity":"High","action":"Logged"}"#,
        )
        .await;
        let attack = NewAttackLog {
            attack_type: "XSS".into(),
            source_ip: "78.90.123.45".into(),
            target: "Web Server".into(),
            severity: Severity::High,
            action: "Logged".into(),
        };
        let created = api.create_attack(&attack).await.unwrap();
        assert_eq!(created.id, Some(9));
        assert_eq!(created.severity, Severity::High);

        let sent = rx.await.unwrap();
        assert!(sent.starts_with("POST /api/attacks HTTP/1.1"));
        assert!(sent.contains(r#""source_ip":"78.90.123.45""#));
        assert!(sent.contains(r#""severity":"High""#));
    }

    #[tokio::test]
    async fn test_non_success_is_request_error() {
        let (api, _rx) = capture_once("HTTP/1.1 404 Not Found", r#"{"detail":"Not Found"}"#).await;
        match api.list_attacks().await {
            Err(SyncError::Request { status, message }) => {
                assert_eq!(status, Some(404));
                assert!(message.contains("Not Found"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
