//! On-disk wrapper format: plaintext metadata next to an encrypted record and the
//! checksum of its plaintext.
//!
//! Storage versions:
//! - `1.1` (current): every field present.
//! - `1.0` (legacy): no `encryption_version` (implied `aes-256-gcm-v1`), optional `archived_at`.
//!
//! Both require a checksum; a wrapper without one cannot be verified and is reported as
//! unknown rather than trusted.

use chats_core::integrity::IntegrityCode;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cipher::ENCRYPTION_VERSION;

pub const STORAGE_VERSION: &str = "1.1";
pub const LEGACY_STORAGE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVersion {
    V1_0,
    V1_1,
}

impl StorageVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageVersion::V1_0 => LEGACY_STORAGE_VERSION,
            StorageVersion::V1_1 => STORAGE_VERSION,
        }
    }
}

/// Field-level view of a wrapper file, tolerant of missing fields.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RawWrapper {
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A parsed wrapper. Content is still encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct Wrapper {
    pub metadata: Map<String, Value>,
    pub encrypted_content: String,
    pub encryption_version: String,
    pub checksum: String,
    pub archived_at: Option<DateTime<Utc>>,
    pub storage_version: StorageVersion,
}

impl Wrapper {
    pub fn new(
        metadata: Map<String, Value>,
        encrypted_content: String,
        checksum: String,
        archived_at: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata,
            encrypted_content,
            encryption_version: ENCRYPTION_VERSION.to_string(),
            checksum,
            archived_at: Some(archived_at),
            storage_version: StorageVersion::V1_1,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IntegrityCode> {
        let raw: RawWrapper =
            serde_json::from_slice(bytes).map_err(|_| IntegrityCode::WrapperLoadFail)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawWrapper) -> Result<Self, IntegrityCode> {
        let storage_version = match raw.version.as_deref() {
            Some(STORAGE_VERSION) => StorageVersion::V1_1,
            Some(LEGACY_STORAGE_VERSION) | None => StorageVersion::V1_0,
            Some(_) => return Err(IntegrityCode::UnsupportedStorageVersion),
        };

        let Value::Object(metadata) = raw.metadata else {
            return Err(IntegrityCode::WrapperLoadFail);
        };

        let encryption_version = match (storage_version, raw.encryption_version) {
            (_, Some(tag)) => tag,
            (StorageVersion::V1_0, None) => ENCRYPTION_VERSION.to_string(),
            (StorageVersion::V1_1, None) => return Err(IntegrityCode::WrapperLoadFail),
        };

        let checksum = raw
            .checksum
            .filter(|c| !c.is_empty())
            .ok_or(IntegrityCode::WrapperNoChecksum)?;

        Ok(Self {
            metadata,
            encrypted_content: raw.encrypted_content.unwrap_or_default(),
            encryption_version,
            checksum,
            archived_at: raw.archived_at.as_deref().and_then(parse_timestamp),
            storage_version,
        })
    }

    pub fn record_id(&self) -> Option<&str> {
        chats_core::ID_FIELDS
            .iter()
            .filter_map(|field| self.metadata.get(*field).and_then(|v| v.as_str()))
            .find(|id| !id.is_empty())
    }

    /// Serialize in the current format.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        let raw = RawWrapper {
            metadata: Value::Object(self.metadata.clone()),
            encrypted_content: Some(self.encrypted_content.clone()),
            encryption_version: Some(self.encryption_version.clone()),
            checksum: Some(self.checksum.clone()),
            archived_at: self.archived_at.map(|at| at.to_rfc3339()),
            version: Some(STORAGE_VERSION.to_string()),
        };
        serde_json::to_vec(&raw)
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).expect("serialize")
    }

    #[test]
    fn current_wrapper_round_trips() {
        let mut metadata = Map::new();
        metadata.insert("id".into(), json!("abc123"));
        let wrapper = Wrapper::new(metadata, "ZW5j".into(), "00ff".into(), Utc::now());

        let parsed = Wrapper::from_slice(&wrapper.to_vec().expect("encode")).expect("parse");
        assert_eq!(parsed.storage_version, StorageVersion::V1_1);
        assert_eq!(parsed.record_id(), Some("abc123"));
        assert_eq!(parsed.encryption_version, ENCRYPTION_VERSION);
        assert_eq!(parsed.checksum, "00ff");
    }

    #[test]
    fn legacy_wrapper_gets_implied_encryption_version() {
        let parsed = Wrapper::from_slice(&bytes(json!({
            "metadata": {"conversation_id": "legacy"},
            "encrypted_content": "ZW5j",
            "checksum": "aa",
            "archived_at": "2024-03-01T10:00:00.123456",
            "version": "1.0"
        })))
        .expect("parse");

        assert_eq!(parsed.storage_version, StorageVersion::V1_0);
        assert_eq!(parsed.encryption_version, ENCRYPTION_VERSION);
        assert_eq!(parsed.record_id(), Some("legacy"));
        assert!(parsed.archived_at.is_some());
    }

    #[test]
    fn rejects_unknown_version_missing_checksum_and_garbage() {
        assert_eq!(
            Wrapper::from_slice(&bytes(json!({"metadata": {}, "checksum": "a", "version": "9.0"}))),
            Err(IntegrityCode::UnsupportedStorageVersion)
        );
        assert_eq!(
            Wrapper::from_slice(&bytes(json!({"metadata": {}, "version": "1.0"}))),
            Err(IntegrityCode::WrapperNoChecksum)
        );
        assert_eq!(
            Wrapper::from_slice(&bytes(json!({"metadata": {}, "checksum": "a", "version": "1.1"}))),
            Err(IntegrityCode::WrapperLoadFail)
        );
        assert_eq!(
            Wrapper::from_slice(b"{\"metadata\": {\"id\": \"trunc"),
            Err(IntegrityCode::WrapperLoadFail)
        );
    }
}
