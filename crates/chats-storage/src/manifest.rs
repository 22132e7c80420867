use std::{fs, io, path::Path};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::wrapper::STORAGE_VERSION;

/// `ARCHIVE.json`: binds an archive directory to the fingerprint of its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<String>,
    pub key_fingerprint: String,
}

impl ArchiveManifest {
    pub fn new(key_fingerprint: impl Into<String>) -> Self {
        Self {
            version: STORAGE_VERSION.to_string(),
            created_at: Some(Utc::now().to_rfc3339()),
            rotated_at: None,
            key_fingerprint: key_fingerprint.into(),
        }
    }

    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        crate::write_private(path, &body)
    }
}

/// Result of binding the active key to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBinding {
    /// Manifest matches (or was just created for) the active key.
    Bound,
    /// Manifest names a different key.
    Mismatch { expected: String, found: String },
    /// Manifest could not be read or written; treated as a mismatch.
    Unverifiable(String),
}

impl KeyBinding {
    pub fn is_bound(&self) -> bool {
        matches!(self, KeyBinding::Bound)
    }
}

/// Load the manifest, creating it for `fingerprint` if the archive has none.
pub fn load_or_init(path: &Path, fingerprint: &str) -> KeyBinding {
    match ArchiveManifest::read(path) {
        Ok(Some(manifest)) if manifest.key_fingerprint == fingerprint => KeyBinding::Bound,
        Ok(Some(manifest)) => {
            error!(
                expected = %manifest.key_fingerprint,
                found = %fingerprint,
                "archive key fingerprint mismatch; reads will fail closed"
            );
            KeyBinding::Mismatch {
                expected: manifest.key_fingerprint,
                found: fingerprint.to_string(),
            }
        }
        Ok(None) => match ArchiveManifest::new(fingerprint).write(path) {
            Ok(()) => {
                info!(fingerprint, "initialized archive manifest");
                KeyBinding::Bound
            }
            Err(err) => {
                error!("could not write archive manifest: {err}");
                KeyBinding::Unverifiable(err.to_string())
            }
        },
        Err(err) => {
            error!("could not read archive manifest: {err}");
            KeyBinding::Unverifiable(err.to_string())
        }
    }
}
