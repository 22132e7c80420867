//! Offline archive key rotation.
//!
//! Every wrapper that verifies under the old key is re-sealed under the new key in place
//! (atomic per file). Wrappers that do not verify are left untouched and counted as failed,
//! so damaged content is never re-sealed under a fresh checksum. The manifest is rebound to
//! the new key last.

use std::{fs, path::Path, path::PathBuf};

use chats_core::integrity::IntegrityCode;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    cipher::{checksum, ArchiveCipher},
    config::MANIFEST_FILE,
    encrypted_store::{EncryptedStore, StoreError},
    key_manager::EncryptionKey,
    manifest::ArchiveManifest,
    wrapper::Wrapper,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub rotated: usize,
    pub failed: usize,
    pub failed_paths: Vec<PathBuf>,
}

#[instrument(skip_all, fields(root = %root.display()))]
pub fn rotate_archive(
    root: &Path,
    old_key: &EncryptionKey,
    new_key: &EncryptionKey,
) -> Result<RotationReport, StoreError> {
    let store = EncryptedStore::open(root, old_key)?;
    if store.is_poisoned() {
        return Err(StoreError::KeyMismatch);
    }
    let new_cipher = ArchiveCipher::new(new_key);

    let mut report = RotationReport::default();
    for path in store.wrapper_files() {
        match reseal(&path, store.cipher(), &new_cipher) {
            Ok(()) => report.rotated += 1,
            Err(reason) => {
                warn!(path = %path.display(), %reason, "skipping wrapper during rotation");
                report.failed += 1;
                report.failed_paths.push(path);
            }
        }
    }

    let manifest_path = root.join(MANIFEST_FILE);
    let mut manifest = ArchiveManifest::read(&manifest_path)?
        .unwrap_or_else(|| ArchiveManifest::new(old_key.fingerprint()));
    manifest.key_fingerprint = new_key.fingerprint();
    manifest.rotated_at = Some(Utc::now().to_rfc3339());
    manifest.write(&manifest_path)?;

    info!(
        rotated = report.rotated,
        failed = report.failed,
        fingerprint = %manifest.key_fingerprint,
        "archive key rotated"
    );
    Ok(report)
}

fn reseal(path: &Path, old: &ArchiveCipher, new: &ArchiveCipher) -> Result<(), String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let mut wrapper = Wrapper::from_slice(&bytes).map_err(|code| code.to_string())?;
    let plaintext = old
        .open(&wrapper.encryption_version, &wrapper.encrypted_content)
        .map_err(|code| code.to_string())?;
    if checksum(&plaintext) != wrapper.checksum {
        return Err(IntegrityCode::ChecksumMismatch.to_string());
    }

    wrapper.encrypted_content = new
        .seal(&plaintext)
        .map_err(|_| "encryption failed".to_string())?;
    wrapper.encryption_version = crate::cipher::ENCRYPTION_VERSION.to_string();
    wrapper.archived_at.get_or_insert_with(Utc::now);
    let body = wrapper.to_vec().map_err(|e| e.to_string())?;
    crate::write_private(path, &body).map_err(|e| e.to_string())
}
