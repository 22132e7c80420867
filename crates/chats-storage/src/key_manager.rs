use std::{fmt, fs, io, path::PathBuf, sync::Arc};

use base64::{engine::general_purpose, Engine as _};
use chats_core::secret_store::SecretStore;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::ArchiveConfig;

/// 256-bit archive key. `Debug` shows the fingerprint only.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    bytes: [u8; 32],
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Non-secret identifier: first 16 hex chars of SHA-256 over the key bytes.
    pub fn fingerprint(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.bytes));
        digest[..16].to_string()
    }

    pub fn encode(&self) -> String {
        general_purpose::STANDARD.encode(self.bytes)
    }

    pub fn decode(secret: &str) -> Result<Self, KeyError> {
        let bytes = general_purpose::STANDARD
            .decode(secret.trim())
            .map_err(|e| KeyError::Decode(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(KeyError::Decode(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self { bytes: out })
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("decode error: {0}")]
    Decode(String),
    /// Key material exists but does not parse; refusing to generate a replacement.
    #[error("stored key in {source_name} is invalid; reconcile it (key-import) before continuing")]
    Invalid { source_name: &'static str },
    #[error("key file error: {0}")]
    Io(#[from] io::Error),
    #[error("could not persist key: {0}")]
    Persist(String),
}

/// Where a key was found or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLocation {
    SecretStore,
    LocalFile,
}

impl KeyLocation {
    fn name(&self) -> &'static str {
        match self {
            KeyLocation::SecretStore => "secret store",
            KeyLocation::LocalFile => "local key file",
        }
    }
}

/// Owns the archive key lifecycle: secret store first, owner-only local file second.
pub struct KeyManager {
    secrets: Arc<dyn SecretStore>,
    service: String,
    account: String,
    key_file: PathBuf,
}

impl KeyManager {
    pub fn new(config: &ArchiveConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            service: config.secret_service.clone(),
            account: config.key_account.clone(),
            key_file: config.key_file.clone(),
        }
    }

    /// Return the stored key, creating and persisting one only if no key material exists.
    #[instrument(skip_all)]
    pub fn get_or_create_key(&self) -> Result<EncryptionKey, KeyError> {
        let mut invalid: Option<KeyLocation> = None;
        for location in [KeyLocation::SecretStore, KeyLocation::LocalFile] {
            let Some(secret) = self.read(location)? else {
                continue;
            };
            match EncryptionKey::decode(&secret) {
                Ok(key) => return Ok(key),
                Err(err) => {
                    warn!(source = location.name(), "ignoring unparsable key: {err}");
                    invalid.get_or_insert(location);
                }
            }
        }

        if let Some(location) = invalid {
            return Err(KeyError::Invalid {
                source_name: location.name(),
            });
        }

        let key = EncryptionKey::generate();
        let location = self.persist(&key)?;
        info!(
            location = location.name(),
            fingerprint = %key.fingerprint(),
            "created new archive key"
        );
        Ok(key)
    }

    /// Encoded key for backup, if one exists. Never generates.
    pub fn export_key(&self) -> Result<Option<String>, KeyError> {
        for location in [KeyLocation::SecretStore, KeyLocation::LocalFile] {
            if let Some(secret) = self.read(location)? {
                if EncryptionKey::decode(&secret).is_ok() {
                    return Ok(Some(secret.trim().to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Validate and persist a key from backup, replacing whatever is stored.
    pub fn import_key(&self, encoded: &str) -> Result<(EncryptionKey, KeyLocation), KeyError> {
        let key = EncryptionKey::decode(encoded)?;
        let location = self.persist(&key)?;
        Ok((key, location))
    }

    fn read(&self, location: KeyLocation) -> Result<Option<String>, KeyError> {
        match location {
            KeyLocation::SecretStore => match self.secrets.get(&self.service, &self.account) {
                Ok(value) => Ok(value.filter(|v| !v.trim().is_empty())),
                Err(err) => {
                    warn!("secret store read failed, trying local key file: {err}");
                    Ok(None)
                }
            },
            KeyLocation::LocalFile => match fs::read_to_string(&self.key_file) {
                Ok(contents) if contents.trim().is_empty() => Ok(None),
                Ok(contents) => Ok(Some(contents.trim().to_string())),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(KeyError::Io(err)),
            },
        }
    }

    fn persist(&self, key: &EncryptionKey) -> Result<KeyLocation, KeyError> {
        let encoded = key.encode();
        match self.secrets.set(&self.service, &self.account, &encoded) {
            // Some backends accept writes they cannot return later; only trust a read-back.
            Ok(()) => match self.secrets.get(&self.service, &self.account) {
                Ok(Some(stored)) if stored == encoded => return Ok(KeyLocation::SecretStore),
                _ => warn!("secret store did not retain the key, using local key file"),
            },
            Err(err) => warn!("could not store key in secret store: {err}"),
        }

        crate::write_private(&self.key_file, encoded.as_bytes())
            .map_err(|e| KeyError::Persist(format!("{}: {e}", self.key_file.display())))?;
        warn!(path = %self.key_file.display(), "archive key stored in local file");
        self.clear_shadowing_entry(&encoded)?;
        Ok(KeyLocation::LocalFile)
    }

    /// The secret store is read before the file, so a different key left there would hide
    /// the one just written.
    fn clear_shadowing_entry(&self, encoded: &str) -> Result<(), KeyError> {
        match self.secrets.get(&self.service, &self.account) {
            Ok(Some(stale)) if stale.trim() != encoded => {
                self.secrets
                    .delete(&self.service, &self.account)
                    .map_err(|e| {
                        KeyError::Persist(format!(
                            "secret store still holds a different key and it could not be \
                             removed ({e}); the new key is only in {}",
                            self.key_file.display()
                        ))
                    })?;
                warn!("removed a different key from the secret store");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chats_core::secret_store::{InMemorySecretStore, SecretStoreError};

    use super::*;

    fn manager(dir: &std::path::Path, secrets: InMemorySecretStore) -> KeyManager {
        KeyManager::new(&ArchiveConfig::new(dir), Arc::new(secrets))
    }

    #[test]
    fn creates_once_then_returns_same_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = InMemorySecretStore::new();
        let manager = manager(dir.path(), secrets.clone());

        let first = manager.get_or_create_key().expect("create");
        let second = manager.get_or_create_key().expect("fetch");
        assert_eq!(first, second);
        assert_eq!(
            secrets.get(SECRET, ACCOUNT).expect("get"),
            Some(first.encode())
        );
        assert!(!dir.path().join(".encryption_key").exists());
    }

    #[test]
    fn falls_back_to_owner_only_file_when_secret_store_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), InMemorySecretStore::read_only());

        let key = manager.get_or_create_key().expect("create");
        let path = dir.path().join(".encryption_key");
        let stored = fs::read_to_string(&path).expect("key file");
        assert_eq!(stored, key.encode());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert_eq!(manager.get_or_create_key().expect("reload"), key);
    }

    #[test]
    fn invalid_stored_key_is_not_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = InMemorySecretStore::new();
        secrets.set(SECRET, ACCOUNT, "not-a-key").expect("set");
        let manager = manager(dir.path(), secrets.clone());

        let err = manager.get_or_create_key().expect_err("must refuse");
        assert!(matches!(err, KeyError::Invalid { .. }));
        assert_eq!(
            secrets.get(SECRET, ACCOUNT).expect("get").as_deref(),
            Some("not-a-key")
        );
    }

    #[test]
    fn invalid_secret_store_entry_defers_to_valid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = EncryptionKey::generate();
        fs::write(dir.path().join(".encryption_key"), key.encode()).expect("write");
        let secrets = InMemorySecretStore::new();
        secrets.set(SECRET, ACCOUNT, "garbage").expect("set");

        let loaded = manager(dir.path(), secrets).get_or_create_key().expect("load");
        assert_eq!(loaded, key);
    }

    #[test]
    fn import_replaces_and_export_returns_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), InMemorySecretStore::new());
        assert_eq!(manager.export_key().expect("export"), None);

        let key = EncryptionKey::generate();
        let (imported, location) = manager.import_key(&key.encode()).expect("import");
        assert_eq!(imported, key);
        assert_eq!(location, KeyLocation::SecretStore);
        assert_eq!(manager.export_key().expect("export"), Some(key.encode()));
        assert!(matches!(
            manager.import_key("abcd"),
            Err(KeyError::Decode(_))
        ));
    }

    /// Serves whatever it was seeded with but refuses every write.
    struct StickyStore {
        inner: InMemorySecretStore,
        deletable: bool,
    }

    impl StickyStore {
        fn holding(key: &EncryptionKey, deletable: bool) -> Self {
            let inner = InMemorySecretStore::new();
            inner.set(SECRET, ACCOUNT, &key.encode()).expect("seed");
            Self { inner, deletable }
        }
    }

    impl SecretStore for StickyStore {
        fn get(&self, service: &str, key: &str) -> Result<Option<String>, SecretStoreError> {
            self.inner.get(service, key)
        }

        fn set(&self, _: &str, _: &str, _: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable {
                reason: "locked".into(),
            })
        }

        fn delete(&self, service: &str, key: &str) -> Result<(), SecretStoreError> {
            if !self.deletable {
                return Err(SecretStoreError::Unavailable {
                    reason: "locked".into(),
                });
            }
            self.inner.delete(service, key)
        }
    }

    #[test]
    fn file_fallback_import_is_not_shadowed_by_stale_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = EncryptionKey::generate();
        let manager = KeyManager::new(
            &ArchiveConfig::new(dir.path()),
            Arc::new(StickyStore::holding(&old, true)),
        );

        let new = EncryptionKey::generate();
        let (_, location) = manager.import_key(&new.encode()).expect("import");
        assert_eq!(location, KeyLocation::LocalFile);
        assert_eq!(manager.get_or_create_key().expect("load"), new);
    }

    #[test]
    fn file_fallback_import_fails_when_stale_entry_cannot_be_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = EncryptionKey::generate();
        let manager = KeyManager::new(
            &ArchiveConfig::new(dir.path()),
            Arc::new(StickyStore::holding(&old, false)),
        );

        let new = EncryptionKey::generate();
        let err = manager.import_key(&new.encode()).expect_err("shadowed");
        assert!(matches!(err, KeyError::Persist(_)));
        assert_eq!(
            fs::read_to_string(dir.path().join(".encryption_key")).expect("file"),
            new.encode()
        );
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let key = EncryptionKey::from_bytes([7u8; 32]);
        assert_eq!(key.fingerprint().len(), 16);
        assert_eq!(key.fingerprint(), key.clone().fingerprint());
        assert_ne!(
            key.fingerprint(),
            EncryptionKey::from_bytes([8u8; 32]).fingerprint()
        );
        assert!(!format!("{key:?}").contains(&key.encode()));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = EncryptionKey::decode("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    const SECRET: &str = crate::config::SECRET_SERVICE;
    const ACCOUNT: &str = crate::config::KEY_ACCOUNT;
}
