use chats_core::secret_store::{SecretStore, SecretStoreError};

/// OS keychain-backed secret store (macOS Keychain, Windows Credential Manager, Linux
/// kernel keyutils) via the `keyring` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self
    }
}

fn entry(service: &str, key: &str) -> Result<keyring::Entry, SecretStoreError> {
    keyring::Entry::new(service, key).map_err(|e| SecretStoreError::Unavailable {
        reason: e.to_string(),
    })
}

fn storage_err(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            SecretStoreError::Unavailable {
                reason: err.to_string(),
            }
        }
        other => SecretStoreError::Storage {
            reason: other.to_string(),
        },
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, SecretStoreError> {
        match entry(service, key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), SecretStoreError> {
        entry(service, key)?.set_password(value).map_err(storage_err)
    }

    fn delete(&self, service: &str, key: &str) -> Result<(), SecretStoreError> {
        match entry(service, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }
}
