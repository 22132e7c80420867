use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

/// Errors produced by secret store backends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretStoreError {
    /// The backend cannot be reached or refuses the operation.
    #[error("secret store unavailable: {reason}")]
    Unavailable { reason: String },
    /// Underlying storage failure.
    #[error("secret store failure: {reason}")]
    Storage { reason: String },
}

/// Contract for the OS credential store that holds the archive key and session token.
///
/// Synchronous, matching the OS keychain APIs behind it.
pub trait SecretStore: Send + Sync {
    /// Fetch the secret stored under `(service, key)`. A missing entry is `Ok(None)`.
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, SecretStoreError>;

    /// Persist a secret, overwriting any existing entry.
    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), SecretStoreError>;

    /// Remove a secret (idempotent).
    fn delete(&self, service: &str, key: &str) -> Result<(), SecretStoreError>;
}

type Entries = HashMap<(String, String), String>;

/// In-memory secret store for tests and ephemeral sessions.
#[derive(Debug, Clone)]
pub struct InMemorySecretStore {
    inner: Arc<Mutex<Entries>>,
    writable: bool,
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            writable: true,
        }
    }
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes, standing in for a locked or missing OS keychain.
    pub fn read_only() -> Self {
        Self {
            writable: false,
            ..Self::default()
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, Entries>, SecretStoreError> {
        self.inner.lock().map_err(|err| SecretStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, SecretStoreError> {
        let map = self.entries()?;
        Ok(map.get(&(service.to_string(), key.to_string())).cloned())
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), SecretStoreError> {
        if !self.writable {
            return Err(SecretStoreError::Unavailable {
                reason: "read-only store".to_string(),
            });
        }
        let mut map = self.entries()?;
        map.insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> Result<(), SecretStoreError> {
        let mut map = self.entries()?;
        map.remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}
