use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chats_core::{
    fetcher::{ApiStatus, FetchError, Fetcher},
    id_prefix,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT},
    StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::token::MIN_TOKEN_LEN;

pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api";

/// Tunables for [`ConversationFetcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherSettings {
    pub base_url: String,
    pub page_size: usize,
    /// Pause between listing pages.
    pub request_delay: Duration,
    pub max_retries: u32,
    /// First backoff; doubles on each retry.
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: 100,
            request_delay: Duration::from_millis(500),
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl FetcherSettings {
    /// `initial_backoff * 2^attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Deserialize)]
struct ConversationPage {
    #[serde(default)]
    items: Vec<Value>,
}

/// Map a health-probe response onto an [`ApiStatus`] and a human-readable message.
pub fn classify_status(status: u16, body: &str) -> (ApiStatus, String) {
    match status {
        200 if body.to_lowercase().contains("deprecated") => {
            (ApiStatus::Deprecated, "API endpoint is deprecated".into())
        }
        200 => (ApiStatus::Ok, "API responding normally".into()),
        401 => (
            ApiStatus::Blocked,
            "Authentication failed (token invalid/expired)".into(),
        ),
        403 => (ApiStatus::Blocked, "Access forbidden".into()),
        429 => (ApiStatus::Ok, "API responding (rate limited)".into()),
        500..=599 => (ApiStatus::Unreachable, format!("Server error {status}")),
        other => (ApiStatus::Unknown, format!("Unexpected status {other}")),
    }
}

/// Fetcher for the conversation backend API, authenticated with a session bearer token.
pub struct ConversationFetcher {
    client: reqwest::Client,
    settings: FetcherSettings,
}

impl ConversationFetcher {
    pub fn new(token: &str, settings: FetcherSettings) -> Result<Self> {
        anyhow::ensure!(
            token.len() >= MIN_TOKEN_LEN,
            "invalid auth token format (expected a session bearer token)"
        );
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("chats-archive/1.0"));
        let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("auth token contains characters not allowed in a header")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    /// GET with bounded retries on 429 and timeouts. Any other outcome is returned as is.
    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, FetchError> {
        let attempts = self.settings.max_retries.max(1);
        for attempt in 0..attempts {
            let last = attempt + 1 == attempts;
            match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = self.settings.backoff(attempt);
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::time::sleep(wait).await;
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_timeout() && !last => {
                    tokio::time::sleep(self.settings.backoff(attempt)).await;
                }
                Err(err) if err.is_timeout() => return Err(FetchError::Timeout),
                Err(err) => return Err(FetchError::Transport(err.to_string())),
            }
        }
        Err(FetchError::RateLimited { attempts })
    }

    /// One listing page starting at `offset`, and whether another may follow.
    pub async fn fetch_page(&self, offset: usize) -> Result<(Vec<Value>, bool), FetchError> {
        let limit = self.settings.page_size;
        let resp = self
            .get_with_retry(
                &self.url("/conversations"),
                &[("offset", offset.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let page: ConversationPage = resp
                    .json()
                    .await
                    .map_err(|e| FetchError::Decode(e.to_string()))?;
                let more = page.items.len() == limit;
                Ok((page.items, more))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::Auth(format!("listing returned {}", resp.status())))
            }
            other => Err(FetchError::Status(other.as_u16())),
        }
    }
}

#[async_trait]
impl Fetcher for ConversationFetcher {
    fn name(&self) -> &'static str {
        "backend-api"
    }

    #[instrument(skip_all)]
    async fn check_health(&self) -> (ApiStatus, String) {
        let probe = self
            .client
            .get(self.url("/conversations"))
            .query(&[("limit", "1")])
            .send()
            .await;
        match probe {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                classify_status(status, &body)
            }
            Err(err) if err.is_timeout() => (ApiStatus::Unreachable, "Request timeout".into()),
            Err(err) if err.is_connect() => {
                (ApiStatus::Unreachable, "Network connection failed".into())
            }
            Err(err) => (ApiStatus::Unknown, err.to_string()),
        }
    }

    #[instrument(skip_all, fields(page_size = self.settings.page_size))]
    async fn list_all(&self) -> Result<Vec<Value>, FetchError> {
        let mut all = Vec::new();
        loop {
            let (batch, more) = self.fetch_page(all.len()).await?;
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
            debug!(fetched = all.len(), "listing page received");
            tokio::time::sleep(self.settings.request_delay).await;
            if !more {
                break;
            }
        }
        info!(count = all.len(), "listing complete");
        Ok(all)
    }

    #[instrument(skip_all, fields(record = id_prefix(id)))]
    async fn fetch_detail(&self, id: &str) -> Result<Option<Value>, FetchError> {
        let resp = self
            .get_with_retry(&self.url(&format!("/conversation/{id}")), &[])
            .await?;
        match resp.status() {
            StatusCode::OK => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| FetchError::Decode(e.to_string())),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::Auth(format!("detail returned {}", resp.status())))
            }
            other => Err(FetchError::Status(other.as_u16())),
        }
    }

    async fn validate_credentials(&self) -> bool {
        self.client
            .get(self.url("/conversations"))
            .query(&[("limit", "1")])
            .send()
            .await
            .map(|resp| resp.status() == StatusCode::OK)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const TOKEN: &str = "test-session-token-0123456789";

    /// Serves one canned response per connection, in order, and records raw requests.
    async fn scripted(responses: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                while let Ok(n) = socket.read(&mut buf[read..]).await {
                    read += n;
                    if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                seen.lock()
                    .expect("requests")
                    .push(String::from_utf8_lossy(&buf[..read]).into_owned());
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), requests)
    }

    fn fetcher(base_url: String) -> ConversationFetcher {
        ConversationFetcher::new(
            TOKEN,
            FetcherSettings {
                base_url,
                page_size: 2,
                request_delay: Duration::ZERO,
                initial_backoff: Duration::from_millis(1),
                ..FetcherSettings::default()
            },
        )
        .expect("fetcher")
    }

    fn request_line(raw: &str) -> &str {
        raw.lines().next().unwrap_or_default()
    }

    #[test]
    fn classifies_probe_statuses() {
        assert_eq!(classify_status(200, "{}").0, ApiStatus::Ok);
        assert_eq!(
            classify_status(200, "This endpoint is DEPRECATED").0,
            ApiStatus::Deprecated
        );
        assert_eq!(classify_status(401, "").0, ApiStatus::Blocked);
        assert_eq!(classify_status(403, "").0, ApiStatus::Blocked);
        assert_eq!(classify_status(429, "").0, ApiStatus::Ok);
        assert_eq!(
            classify_status(503, ""),
            (ApiStatus::Unreachable, "Server error 503".to_string())
        );
        assert_eq!(classify_status(302, "").0, ApiStatus::Unknown);
    }

    #[test]
    fn backoff_doubles_from_initial() {
        let settings = FetcherSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_secs(2));
        assert_eq!(settings.backoff(1), Duration::from_secs(4));
        assert_eq!(settings.backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn rejects_short_tokens() {
        assert!(ConversationFetcher::new("short", FetcherSettings::default()).is_err());
    }

    #[tokio::test]
    async fn lists_every_page_with_bearer_auth() {
        let (base, requests) = scripted(vec![
            (200, json!({"items": [{"id": "a"}, {"id": "b"}]}).to_string()),
            (200, json!({"items": [{"id": "c"}]}).to_string()),
        ])
        .await;

        let listing = fetcher(base).list_all().await.expect("list");
        let ids: Vec<_> = listing.iter().map(|m| m["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b"), json!("c")]);

        let requests = requests.lock().expect("requests").clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            request_line(&requests[0]),
            "GET /conversations?offset=0&limit=2 HTTP/1.1"
        );
        assert_eq!(
            request_line(&requests[1]),
            "GET /conversations?offset=2&limit=2 HTTP/1.1"
        );
        assert!(requests[0]
            .to_lowercase()
            .contains(&format!("authorization: bearer {TOKEN}").to_lowercase()));
    }

    #[tokio::test]
    async fn detail_maps_statuses_and_retries_rate_limits() {
        let (base, requests) = scripted(vec![
            (404, "{}".into()),
            (401, "{}".into()),
            (429, "{}".into()),
            (200, json!({"title": "t", "mapping": {}}).to_string()),
        ])
        .await;
        let fetcher = fetcher(base);

        assert_eq!(fetcher.fetch_detail("gone").await, Ok(None));
        assert!(matches!(
            fetcher.fetch_detail("denied").await,
            Err(FetchError::Auth(_))
        ));
        assert_eq!(
            fetcher.fetch_detail("slow").await,
            Ok(Some(json!({"title": "t", "mapping": {}})))
        );
        assert_eq!(
            request_line(&requests.lock().expect("requests")[3]),
            "GET /conversation/slow HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn gives_up_after_max_rate_limited_attempts() {
        let (base, _) = scripted(vec![(429, "{}".into()); 3]).await;
        assert_eq!(
            fetcher(base).fetch_detail("busy").await,
            Err(FetchError::RateLimited { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn health_and_credentials_follow_probe_status() {
        let (base, _) = scripted(vec![
            (200, r#"{"detail": "deprecated"}"#.into()),
            (401, "{}".into()),
            (200, r#"{"items": []}"#.into()),
        ])
        .await;
        let fetcher = fetcher(base);
        assert_eq!(fetcher.check_health().await.0, ApiStatus::Deprecated);
        assert!(!fetcher.validate_credentials().await);
        assert!(fetcher.validate_credentials().await);
    }
}
