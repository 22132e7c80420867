use std::{fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::encrypted_store::EncryptedStore;

const IMPORT_SOURCE: &str = "manual_import";
const DEFAULT_TITLE: &str = "Imported Conversation";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read export file: {0}")]
    Io(#[from] io::Error),
    #[error("export file is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected export structure: expected a list or an object with `conversations`")]
    Structure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub found: usize,
    pub imported: usize,
    pub failed: usize,
}

/// Loads a provider JSON export (`[...]` or `{"conversations": [...]}`) into the archive.
pub struct Importer<'a> {
    store: &'a EncryptedStore,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a EncryptedStore) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn import_file(&self, path: &Path) -> Result<ImportReport, ImportError> {
        let data: Value = serde_json::from_slice(&fs::read(path)?)?;
        let records = match data {
            Value::Array(records) => records,
            Value::Object(mut map) => match map.remove("conversations") {
                Some(Value::Array(records)) => records,
                _ => return Err(ImportError::Structure),
            },
            _ => return Err(ImportError::Structure),
        };

        let mut report = ImportReport {
            found: records.len(),
            ..ImportReport::default()
        };
        info!(found = report.found, "importing export file");

        for (index, record) in records.iter().enumerate() {
            if self.import_one(record) {
                report.imported += 1;
            } else {
                warn!(index, "failed to import record");
                report.failed += 1;
            }
        }
        info!(imported = report.imported, failed = report.failed, "import finished");
        Ok(report)
    }

    fn import_one(&self, record: &Value) -> bool {
        if !record.is_object() {
            return false;
        }
        self.store.store(record, &import_metadata(record, Utc::now()))
    }
}

/// Metadata for an imported record. Records without an identifier get a content-derived one,
/// so re-importing the same export yields the same ids.
pub fn import_metadata(record: &Value, now: DateTime<Utc>) -> Value {
    let id = match chats_core::record_id(record) {
        Some(id) => id.to_string(),
        None => content_id(record),
    };
    let timestamp = |field: &str| {
        record
            .get(field)
            .and_then(Value::as_f64)
            .and_then(epoch_to_utc)
            .unwrap_or(now)
            .to_rfc3339()
    };

    json!({
        "id": id,
        "title": record.get("title").and_then(Value::as_str).unwrap_or(DEFAULT_TITLE),
        "created_at": timestamp("create_time"),
        "updated_at": timestamp("update_time"),
        "is_archived": false,
        "source": IMPORT_SOURCE,
    })
}

fn content_id(record: &Value) -> String {
    // serde_json maps are key-sorted, so this serialization is canonical.
    let canonical = serde_json::to_vec(record).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(canonical));
    format!("imp_{}", &digest[..16])
}

fn epoch_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_manager::EncryptionKey;

    #[test]
    fn imports_list_and_wrapped_exports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedStore::open(dir.path().join("archive"), &EncryptionKey::generate())
            .expect("open");
        let importer = Importer::new(&store);

        let list = dir.path().join("list.json");
        fs::write(
            &list,
            r#"[{"id": "c1", "title": "First", "create_time": 1700000000.5, "mapping": {}},
                {"title": "No id", "mapping": {}},
                "not-a-record"]"#,
        )
        .expect("write");
        let report = importer.import_file(&list).expect("import");
        assert_eq!(
            report,
            ImportReport {
                found: 3,
                imported: 2,
                failed: 1
            }
        );
        assert_eq!(
            store.retrieve("c1").expect("c1")["title"],
            json!("First")
        );

        let wrapped = dir.path().join("wrapped.json");
        fs::write(&wrapped, r#"{"conversations": [{"id": "c2"}]}"#).expect("write");
        assert_eq!(importer.import_file(&wrapped).expect("import").imported, 1);
        assert!(store.has_valid("c2"));
        assert_eq!(store.stats().count, 3);
    }

    #[test]
    fn rejects_unexpected_structure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedStore::open(dir.path().join("archive"), &EncryptionKey::generate())
            .expect("open");
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"items": []}"#).expect("write");
        assert!(matches!(
            Importer::new(&store).import_file(&path),
            Err(ImportError::Structure)
        ));
        assert!(matches!(
            Importer::new(&store).import_file(&dir.path().join("missing.json")),
            Err(ImportError::Io(_))
        ));
    }

    #[test]
    fn metadata_is_stable_for_idless_records() {
        let now = Utc::now();
        let record = json!({"title": "x", "create_time": 1700000000.0, "mapping": {"a": 1}});
        let first = import_metadata(&record, now);
        let second = import_metadata(&record, now);

        let id = first["id"].as_str().expect("id");
        assert!(id.starts_with("imp_"));
        assert_eq!(id.len(), "imp_".len() + 16);
        assert_eq!(first, second);
        assert_eq!(first["source"], json!("manual_import"));
        assert_eq!(first["created_at"], json!("2023-11-14T22:13:20+00:00"));
        assert_eq!(first["updated_at"], json!(now.to_rfc3339()));
    }
}
