use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Health of the remote conversation API as seen by a fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Deprecated,
    Blocked,
    Unreachable,
    Unknown,
}

impl ApiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStatus::Ok => "ok",
            ApiStatus::Deprecated => "deprecated",
            ApiStatus::Blocked => "blocked",
            ApiStatus::Unreachable => "unreachable",
            ApiStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by a fetcher after its own retries are exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Credentials were rejected (401/403).
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Contract for the remote side of an export: list conversations and fetch their detail.
///
/// Implementations own transient-error handling (backoff, retries); whatever they return
/// is final for the item in question.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    /// Probe the remote API without side effects.
    async fn check_health(&self) -> (ApiStatus, String);

    /// List metadata for every conversation, in remote order.
    async fn list_all(&self) -> Result<Vec<Value>, FetchError>;

    /// Fetch one full conversation. `Ok(None)` means the remote has no such record.
    async fn fetch_detail(&self, id: &str) -> Result<Option<Value>, FetchError>;

    /// Whether the configured credentials are currently accepted.
    async fn validate_credentials(&self) -> bool;
}

/// Canned detail response for [`InMemoryFetcher`].
#[derive(Debug, Clone)]
pub enum DetailResponse {
    Found(Value),
    NotFound,
    Fail(FetchError),
}

#[derive(Debug)]
struct FetcherState {
    details: HashMap<String, DetailResponse>,
    detail_calls: Vec<String>,
    interrupt: Option<(usize, Arc<AtomicBool>)>,
}

/// Scripted fetcher for tests and offline smoke runs. Clones share call history.
#[derive(Debug, Clone)]
pub struct InMemoryFetcher {
    listing: Vec<Value>,
    health: (ApiStatus, String),
    credentials_valid: bool,
    list_error: Option<FetchError>,
    state: Arc<Mutex<FetcherState>>,
}

impl Default for InMemoryFetcher {
    fn default() -> Self {
        Self {
            listing: Vec::new(),
            health: (ApiStatus::Ok, "API responding normally".to_string()),
            credentials_valid: true,
            list_error: None,
            state: Arc::new(Mutex::new(FetcherState {
                details: HashMap::new(),
                detail_calls: Vec::new(),
                interrupt: None,
            })),
        }
    }
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listed record with a detail response.
    pub fn with_record(mut self, metadata: Value, detail: DetailResponse) -> Self {
        if let Some(id) = crate::record_id(&metadata) {
            let id = id.to_string();
            if let Ok(mut state) = self.state.lock() {
                state.details.insert(id, detail);
            }
        }
        self.listing.push(metadata);
        self
    }

    pub fn with_health(mut self, status: ApiStatus, message: impl Into<String>) -> Self {
        self.health = (status, message.into());
        self
    }

    pub fn with_invalid_credentials(mut self) -> Self {
        self.credentials_valid = false;
        self
    }

    pub fn with_list_error(mut self, err: FetchError) -> Self {
        self.list_error = Some(err);
        self
    }

    /// Raise `flag` once `calls` detail fetches have been served.
    pub fn interrupt_after(self, calls: usize, flag: Arc<AtomicBool>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.interrupt = Some((calls, flag));
        }
        self
    }

    /// Replace the detail response for an id (e.g. to heal a failure before a resume).
    pub fn set_detail(&self, id: &str, detail: DetailResponse) {
        if let Ok(mut state) = self.state.lock() {
            state.details.insert(id.to_string(), detail);
        }
    }

    /// Ids passed to `fetch_detail`, in call order.
    pub fn detail_calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.detail_calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Fetcher for InMemoryFetcher {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn check_health(&self) -> (ApiStatus, String) {
        self.health.clone()
    }

    async fn list_all(&self) -> Result<Vec<Value>, FetchError> {
        match &self.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.listing.clone()),
        }
    }

    async fn fetch_detail(&self, id: &str) -> Result<Option<Value>, FetchError> {
        let mut state = self
            .state
            .lock()
            .map_err(|err| FetchError::Transport(format!("lock poisoned: {err}")))?;
        state.detail_calls.push(id.to_string());
        if let Some((after, flag)) = &state.interrupt {
            if state.detail_calls.len() == *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        match state.details.get(id) {
            Some(DetailResponse::Found(value)) => Ok(Some(value.clone())),
            Some(DetailResponse::NotFound) | None => Ok(None),
            Some(DetailResponse::Fail(err)) => Err(err.clone()),
        }
    }

    async fn validate_credentials(&self) -> bool {
        self.credentials_valid
    }
}
