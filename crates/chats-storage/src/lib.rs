//! Encrypted, integrity-verified archive storage.
//! Uses AES-256-GCM with keys sourced from the OS keyring (or a local fallback file).

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use tempfile::NamedTempFile;

pub mod cipher;
pub mod config;
pub mod encrypted_store;
pub mod importer;
pub mod key_manager;
pub mod keyring_store;
pub mod manifest;
pub mod rotation;
pub mod wrapper;

pub use config::ArchiveConfig;
pub use encrypted_store::{ArchiveEntry, ArchiveReport, ArchiveStats, EncryptedStore, StoreError};
pub use key_manager::{EncryptionKey, KeyError, KeyManager};

/// Write `bytes` to `path` via a sibling temp file and rename, so readers never observe a
/// partial file. The temp file is created owner-only.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid storage path"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Restrict a directory to its owner. No-op off unix.
pub(crate) fn restrict_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
