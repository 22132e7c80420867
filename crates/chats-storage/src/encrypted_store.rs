use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

use chats_core::{
    id_prefix,
    integrity::{IntegrityCode, IntegrityResult, IntegrityState},
    record_id,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::{
    cipher::{checksum, ArchiveCipher},
    config::{CONVERSATIONS_DIR, MANIFEST_FILE},
    key_manager::EncryptionKey,
    manifest::{self, KeyBinding},
    wrapper::Wrapper,
};

const WRAPPER_PREFIX: &str = "conv-";
const WRAPPER_SUFFIX: &str = ".enc";
const DATE_FORMAT: &str = "%Y-%m-%d";
const LEGACY_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("archive i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("encryption failed")]
    Encrypt,
    #[error("metadata carries no record identifier")]
    MissingIdentifier,
    #[error("metadata must be a JSON object")]
    InvalidMetadata,
    #[error("archive key does not match the archive manifest")]
    KeyMismatch,
}

/// Aggregate view of the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    /// Distinct record identifiers.
    pub count: usize,
    /// Bytes across every wrapper file, duplicates included.
    pub total_bytes: u64,
    pub oldest_date: Option<NaiveDate>,
    pub newest_date: Option<NaiveDate>,
}

/// One wrapper file as seen by a metadata-only listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub record_id: String,
    pub title: String,
    pub date: String,
    pub path: PathBuf,
}

/// Result of a verification sweep over every wrapper file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    pub total_files: usize,
    pub counts: BTreeMap<IntegrityState, usize>,
    pub problems: Vec<IntegrityResult>,
}

impl ArchiveReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Encrypted record store rooted at an archive directory.
///
/// Reads fail closed: if the manifest does not match the key this store was opened with,
/// every verification reports `UNREADABLE` for the lifetime of the instance.
pub struct EncryptedStore {
    root: PathBuf,
    conversations_dir: PathBuf,
    cipher: ArchiveCipher,
    binding: KeyBinding,
}

impl EncryptedStore {
    /// Open (or initialize) an archive. Only directory creation errors are fatal; manifest
    /// problems poison the store instead.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, key: &EncryptionKey) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let conversations_dir = root.join(CONVERSATIONS_DIR);
        fs::create_dir_all(&conversations_dir)?;
        crate::restrict_dir(&root)?;

        let binding = manifest::load_or_init(&root.join(MANIFEST_FILE), &key.fingerprint());
        Ok(Self {
            root,
            conversations_dir,
            cipher: ArchiveCipher::new(key),
            binding,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_binding(&self) -> &KeyBinding {
        &self.binding
    }

    pub(crate) fn cipher(&self) -> &ArchiveCipher {
        &self.cipher
    }

    pub fn is_poisoned(&self) -> bool {
        !self.binding.is_bound()
    }

    /// Encrypt and persist one record. Never errors; `false` means nothing usable was written.
    pub fn store(&self, record: &Value, metadata: &Value) -> bool {
        self.store_at(record, metadata, Utc::now())
    }

    pub(crate) fn store_at(&self, record: &Value, metadata: &Value, now: DateTime<Utc>) -> bool {
        match self.try_store(record, metadata, now) {
            Ok(path) => {
                debug!(path = %path.display(), "stored record");
                true
            }
            Err(err) => {
                let id = record_id(metadata).map(id_prefix).unwrap_or("-");
                error!(record = id, "store failed: {err}");
                false
            }
        }
    }

    #[instrument(skip_all)]
    fn try_store(
        &self,
        record: &Value,
        metadata: &Value,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, StoreError> {
        if self.is_poisoned() {
            return Err(StoreError::KeyMismatch);
        }
        let Value::Object(fields) = metadata else {
            return Err(StoreError::InvalidMetadata);
        };
        let id = record_id(metadata).ok_or(StoreError::MissingIdentifier)?;

        let plaintext = serde_json::to_vec(record)?;
        let digest = checksum(&plaintext);
        let sealed = self
            .cipher
            .seal(&plaintext)
            .map_err(|_| StoreError::Encrypt)?;

        let wrapper = Wrapper::new(fields.clone(), sealed, digest, now);
        let date = now.format(DATE_FORMAT).to_string();
        let date_dir = self.conversations_dir.join(&date);
        fs::create_dir_all(&date_dir)?;
        let path = date_dir.join(wrapper_file_name(id));
        crate::write_private(&path, &wrapper.to_vec()?)?;
        Ok(path)
    }

    /// Full integrity check of the wrapper for `id`, without returning content.
    #[instrument(skip_all, fields(record = id_prefix(id)))]
    pub fn verify(&self, id: &str) -> IntegrityResult {
        self.verify_with_content(id).0
    }

    /// `verify(id)` is `VALID`. This decrypts; existence alone is not enough.
    pub fn has_valid(&self, id: &str) -> bool {
        self.verify(id).is_valid()
    }

    /// The only content read path: returns the record only when it verifies as `VALID`.
    #[instrument(skip_all, fields(record = id_prefix(id)))]
    pub fn retrieve(&self, id: &str) -> Option<Value> {
        let (result, plaintext) = self.verify_with_content(id);
        let plaintext = match (result.state, plaintext) {
            (IntegrityState::Valid, Some(bytes)) => bytes,
            (state, _) => {
                warn!(%state, code = ?result.error_code, "refusing to return record");
                return None;
            }
        };
        match serde_json::from_slice(&plaintext) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(code = %IntegrityCode::JsonDecodeFail, "decrypted record is not JSON: {err}");
                None
            }
        }
    }

    fn verify_with_content(&self, id: &str) -> (IntegrityResult, Option<Vec<u8>>) {
        if self.is_poisoned() {
            return (
                IntegrityResult::failure(id, IntegrityCode::WrongKeyManifestMismatch),
                None,
            );
        }
        match self.find_wrapper(id) {
            Some(path) => self.verify_path(id, &path),
            None => (IntegrityResult::failure(id, IntegrityCode::NotFound), None),
        }
    }

    fn verify_path(&self, id: &str, path: &Path) -> (IntegrityResult, Option<Vec<u8>>) {
        let mut result = IntegrityResult::failure(id, IntegrityCode::WrapperLoadFail);
        result.filepath = Some(path.display().to_string());
        result.size = fs::metadata(path).ok().map(|m| m.len());

        let fail = |mut result: IntegrityResult, code: IntegrityCode| {
            result.state = code.state();
            result.error_code = Some(code);
            (result, None)
        };

        let wrapper = match fs::read(path)
            .map_err(|_| IntegrityCode::WrapperLoadFail)
            .and_then(|bytes| Wrapper::from_slice(&bytes))
        {
            Ok(wrapper) => wrapper,
            Err(code) => return fail(result, code),
        };
        result.expected_checksum = Some(wrapper.checksum.clone());

        let plaintext = match self
            .cipher
            .open(&wrapper.encryption_version, &wrapper.encrypted_content)
        {
            Ok(plaintext) => plaintext,
            Err(code) => return fail(result, code),
        };

        let actual = checksum(&plaintext);
        let matches = actual == wrapper.checksum;
        result.actual_checksum = Some(actual);
        if !matches {
            warn!(record = id_prefix(id), "checksum mismatch");
            return fail(result, IntegrityCode::ChecksumMismatch);
        }

        result.state = IntegrityState::Valid;
        result.error_code = None;
        (result, Some(plaintext))
    }

    /// Exact token, then legacy short prefix, then a metadata scan. Newest partition wins.
    fn find_wrapper(&self, id: &str) -> Option<PathBuf> {
        let files = self.wrapper_files();
        let exact = wrapper_file_name(id);
        if let Some(path) = files.iter().find(|p| file_name(p) == exact) {
            return Some(path.clone());
        }

        let legacy = legacy_prefix(id);
        if !legacy.is_empty() {
            let found = files.iter().find(|p| {
                file_name(p).starts_with(&format!("{WRAPPER_PREFIX}{legacy}"))
                    && match wrapper_record_id(p) {
                        Some(other) => other == id,
                        None => true,
                    }
            });
            if let Some(path) = found {
                return Some(path.clone());
            }
        }

        files
            .into_iter()
            .find(|p| wrapper_record_id(p).as_deref() == Some(id))
    }

    /// Every `conv-*.enc` file, newest date partition first, names sorted within a partition.
    pub(crate) fn wrapper_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.conversations_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort_by(|a, b| b.cmp(a));

        let mut files = Vec::new();
        for dir in dirs {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut in_dir: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| is_wrapper_file(path))
                .collect();
            in_dir.sort();
            files.extend(in_dir);
        }
        files
    }

    /// Distinct ids, total bytes and the date range covered by partitions.
    pub fn stats(&self) -> ArchiveStats {
        let mut ids = HashSet::new();
        let mut stats = ArchiveStats::default();
        for path in self.wrapper_files() {
            if let Some(id) = wrapper_record_id(&path) {
                ids.insert(id);
            }
            stats.total_bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            if let Some(date) = partition_date(&path) {
                stats.oldest_date = Some(stats.oldest_date.map_or(date, |d| d.min(date)));
                stats.newest_date = Some(stats.newest_date.map_or(date, |d| d.max(date)));
            }
        }
        stats.count = ids.len();
        stats
    }

    /// Metadata-only listing; unreadable wrappers are skipped.
    pub fn list(&self) -> Vec<ArchiveEntry> {
        self.wrapper_files()
            .into_iter()
            .filter_map(|path| {
                let wrapper = fs::read(&path)
                    .ok()
                    .and_then(|bytes| Wrapper::from_slice(&bytes).ok())?;
                let record_id = wrapper.record_id()?.to_string();
                let title = wrapper
                    .metadata
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Untitled")
                    .to_string();
                let date = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some(ArchiveEntry {
                    record_id,
                    title,
                    date,
                    path,
                })
            })
            .collect()
    }

    /// Verify every wrapper file individually (duplicates included). Never returns content.
    #[instrument(skip_all)]
    pub fn verify_all(&self) -> ArchiveReport {
        let mut report = ArchiveReport::default();
        for path in self.wrapper_files() {
            let id = wrapper_record_id(&path).unwrap_or_else(|| file_stem(&path));
            let result = if self.is_poisoned() {
                let mut result =
                    IntegrityResult::failure(id, IntegrityCode::WrongKeyManifestMismatch);
                result.filepath = Some(path.display().to_string());
                result
            } else {
                self.verify_path(&id, &path).0
            };

            report.total_files += 1;
            *report.counts.entry(result.state).or_default() += 1;
            if !result.is_valid() {
                report.problems.push(result);
            }
        }
        report
    }
}

/// `conv-<first 16 hex of sha256(id)>.enc`
pub fn wrapper_file_name(id: &str) -> String {
    let token = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{WRAPPER_PREFIX}{}{WRAPPER_SUFFIX}", &token[..16])
}

fn legacy_prefix(id: &str) -> &str {
    match id.char_indices().nth(LEGACY_PREFIX_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_wrapper_file(path: &Path) -> bool {
    let name = file_name(path);
    path.is_file() && name.starts_with(WRAPPER_PREFIX) && name.ends_with(WRAPPER_SUFFIX)
}

fn partition_date(path: &Path) -> Option<NaiveDate> {
    let name = path.parent()?.file_name()?.to_str()?;
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

/// Identifier recorded in a wrapper's plaintext metadata, if the file is readable.
fn wrapper_record_id(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let raw: Value = serde_json::from_slice(&bytes).ok()?;
    record_id(raw.get("metadata")?).map(str::to_string)
}
