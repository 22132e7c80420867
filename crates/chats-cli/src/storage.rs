use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chats_core::secret_store::SecretStore;
use chats_fetch::TokenManager;
use chats_storage::{
    keyring_store::KeyringSecretStore, ArchiveConfig, EncryptedStore, EncryptionKey, KeyManager,
};
use color_eyre::Result;
use dirs::home_dir;
use tracing::{debug, warn};

use crate::config::Config;

/// Resolve the default archive directory (`~/.chats_archive`).
pub fn default_archive_dir() -> Result<PathBuf> {
    let base = home_dir().ok_or_else(|| color_eyre::eyre::eyre!("no home dir available"))?;
    Ok(base.join(".chats_archive"))
}

/// `--archive-dir`, then the config file, then the default location.
pub fn resolve_archive_dir(flag: Option<&Path>, config: &Config) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = &config.archive_dir {
        return Ok(dir.clone());
    }
    default_archive_dir()
}

/// Everything a command needs to reach one archive: its layout and the secret store that
/// holds its key and the session token.
pub struct ArchiveContext {
    pub archive: ArchiveConfig,
    secrets: Arc<dyn SecretStore>,
}

impl ArchiveContext {
    pub fn new(archive: ArchiveConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self { archive, secrets }
    }

    /// Build a context backed by the OS keychain.
    pub fn from_config(root: PathBuf, config: &Config) -> Self {
        let mut archive = ArchiveConfig::new(root);
        if let Some(key_file) = &config.key_file {
            archive = archive.with_key_file(key_file.clone());
        }
        debug!(root = %archive.root().display(), "resolved archive");
        Self::new(archive, Arc::new(KeyringSecretStore::new()))
    }

    pub fn root(&self) -> &Path {
        self.archive.root()
    }

    pub fn key_manager(&self) -> KeyManager {
        KeyManager::new(&self.archive, self.secrets.clone())
    }

    pub fn token_manager(&self) -> TokenManager {
        TokenManager::new(self.secrets.clone())
    }

    pub fn load_key(&self) -> Result<EncryptionKey> {
        self.key_manager()
            .get_or_create_key()
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))
    }

    /// Open the archive with the stored key. A poisoned store still opens; its reads fail
    /// closed, which is what `verify-archive` needs to report.
    pub fn open_store(&self) -> Result<EncryptedStore> {
        let key = self.load_key()?;
        let store = EncryptedStore::open(self.root(), &key)
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
        if store.is_poisoned() {
            warn!("archive key does not match the manifest; every record will read as UNREADABLE");
        }
        Ok(store)
    }
}

/// Helper for tests to construct a context rooted at a temp dir with an in-memory secret store.
#[cfg(test)]
pub fn test_context(root: impl Into<PathBuf>) -> ArchiveContext {
    ArchiveContext::new(
        ArchiveConfig::new(root),
        Arc::new(chats_core::secret_store::InMemorySecretStore::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_config() {
        let config = Config {
            archive_dir: Some(PathBuf::from("/from/config")),
            ..Config::default()
        };
        let dir = resolve_archive_dir(Some(Path::new("/from/flag")), &config).expect("resolve");
        assert_eq!(dir, PathBuf::from("/from/flag"));

        let dir = resolve_archive_dir(None, &config).expect("resolve");
        assert_eq!(dir, PathBuf::from("/from/config"));
    }

    #[test]
    fn key_file_override_is_applied() {
        let config = Config {
            key_file: Some(PathBuf::from("/secure/key")),
            ..Config::default()
        };
        let ctx = ArchiveContext::from_config(PathBuf::from("/tmp/archive"), &config);
        assert_eq!(ctx.archive.key_file, PathBuf::from("/secure/key"));
        assert_eq!(ctx.root(), Path::new("/tmp/archive"));
    }

    #[test]
    fn open_store_reuses_the_same_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let first = ctx.load_key().expect("key");
        let store = ctx.open_store().expect("open");
        assert!(!store.is_poisoned());
        assert_eq!(ctx.load_key().expect("key"), first);
    }
}
