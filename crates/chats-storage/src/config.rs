use std::path::{Path, PathBuf};

pub const CONVERSATIONS_DIR: &str = "conversations";
pub const MANIFEST_FILE: &str = "ARCHIVE.json";
pub const LEDGER_FILE: &str = "jobs.db";
pub const LOCK_FILE: &str = ".lock";
pub const AUDIT_LOG_FILE: &str = "audit.log";
pub const KEY_FILE: &str = ".encryption_key";

pub const SECRET_SERVICE: &str = "chats_archive";
pub const KEY_ACCOUNT: &str = "encryption_key";

/// Where an archive lives and where its key is kept. Passed explicitly to every
/// constructor; nothing resolves home-directory paths implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub root: PathBuf,
    /// Owner-only fallback file used when the secret store cannot hold the key.
    pub key_file: PathBuf,
    pub secret_service: String,
    pub key_account: String,
}

impl ArchiveConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            key_file: root.join(KEY_FILE),
            root,
            secret_service: SECRET_SERVICE.to_string(),
            key_account: KEY_ACCOUNT.to_string(),
        }
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = key_file.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join(CONVERSATIONS_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }
}
