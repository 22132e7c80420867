//! Core contracts for the conversation archive: secret storage, the remote fetcher,
//! integrity results and export job records.
//! Kept free of crypto and I/O so every other crate can depend on it cheaply.

pub mod fetcher;
pub mod integrity;
pub mod jobs;
pub mod secret_store;

/// Metadata field names that may carry a record identifier, in lookup order.
pub const ID_FIELDS: [&str; 2] = ["id", "conversation_id"];

/// Extract the record identifier from a metadata object, if present and non-empty.
pub fn record_id(metadata: &serde_json::Value) -> Option<&str> {
    ID_FIELDS
        .iter()
        .filter_map(|field| metadata.get(field).and_then(|v| v.as_str()))
        .find(|id| !id.is_empty())
}

/// Short, log-safe prefix of an identifier.
pub fn id_prefix(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
