use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of verifying one stored record. Closed set; nothing maps to `Valid` by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityState {
    /// Decrypted and the checksum matched.
    Valid,
    /// Decrypted, but the plaintext hash differs from the stored checksum.
    Corrupt,
    /// Could not be decoded or decrypted (wrong key, tampered ciphertext).
    Unreadable,
    /// No wrapper found for the identifier.
    Missing,
    /// Wrapper exists but is malformed or of an unexpected shape.
    Unknown,
}

impl IntegrityState {
    pub const ALL: [IntegrityState; 5] = [
        IntegrityState::Valid,
        IntegrityState::Corrupt,
        IntegrityState::Unreadable,
        IntegrityState::Missing,
        IntegrityState::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityState::Valid => "VALID",
            IntegrityState::Corrupt => "CORRUPT",
            IntegrityState::Unreadable => "UNREADABLE",
            IntegrityState::Missing => "MISSING",
            IntegrityState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for IntegrityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable diagnostic attached to every non-valid result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityCode {
    NotFound,
    WrapperLoadFail,
    UnsupportedStorageVersion,
    WrapperNoChecksum,
    WrapperNoContent,
    WrapperB64DecodeFail,
    UnsupportedEncryptionVersion,
    CiphertextTooShort,
    DecryptFail,
    ChecksumMismatch,
    JsonDecodeFail,
    WrongKeyManifestMismatch,
}

impl IntegrityCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityCode::NotFound => "NOT_FOUND",
            IntegrityCode::WrapperLoadFail => "WRAPPER_LOAD_FAIL",
            IntegrityCode::UnsupportedStorageVersion => "UNSUPPORTED_STORAGE_VERSION",
            IntegrityCode::WrapperNoChecksum => "WRAPPER_NO_CHECKSUM",
            IntegrityCode::WrapperNoContent => "WRAPPER_NO_CONTENT",
            IntegrityCode::WrapperB64DecodeFail => "WRAPPER_B64_DECODE_FAIL",
            IntegrityCode::UnsupportedEncryptionVersion => "UNSUPPORTED_ENCRYPTION_VERSION",
            IntegrityCode::CiphertextTooShort => "CIPHERTEXT_TOO_SHORT",
            IntegrityCode::DecryptFail => "DECRYPT_FAIL",
            IntegrityCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            IntegrityCode::JsonDecodeFail => "JSON_DECODE_FAIL",
            IntegrityCode::WrongKeyManifestMismatch => "WRONG_KEY_MANIFEST_MISMATCH",
        }
    }

    /// The state a failure with this code resolves to.
    pub fn state(&self) -> IntegrityState {
        match self {
            IntegrityCode::NotFound => IntegrityState::Missing,
            IntegrityCode::WrapperLoadFail
            | IntegrityCode::UnsupportedStorageVersion
            | IntegrityCode::WrapperNoChecksum
            | IntegrityCode::JsonDecodeFail => IntegrityState::Unknown,
            IntegrityCode::WrapperNoContent
            | IntegrityCode::WrapperB64DecodeFail
            | IntegrityCode::UnsupportedEncryptionVersion
            | IntegrityCode::CiphertextTooShort
            | IntegrityCode::DecryptFail
            | IntegrityCode::WrongKeyManifestMismatch => IntegrityState::Unreadable,
            IntegrityCode::ChecksumMismatch => IntegrityState::Corrupt,
        }
    }
}

impl fmt::Display for IntegrityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification report for a single record. Never carries content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityResult {
    pub record_id: String,
    pub state: IntegrityState,
    pub filepath: Option<String>,
    pub size: Option<u64>,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
    pub error_code: Option<IntegrityCode>,
}

impl IntegrityResult {
    /// A failed verification; the state is derived from the code.
    pub fn failure(record_id: impl Into<String>, code: IntegrityCode) -> Self {
        Self {
            record_id: record_id.into(),
            state: code.state(),
            filepath: None,
            size: None,
            expected_checksum: None,
            actual_checksum: None,
            error_code: Some(code),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == IntegrityState::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_never_resolve_to_valid() {
        let codes = [
            IntegrityCode::NotFound,
            IntegrityCode::WrapperLoadFail,
            IntegrityCode::UnsupportedStorageVersion,
            IntegrityCode::WrapperNoChecksum,
            IntegrityCode::WrapperNoContent,
            IntegrityCode::WrapperB64DecodeFail,
            IntegrityCode::UnsupportedEncryptionVersion,
            IntegrityCode::CiphertextTooShort,
            IntegrityCode::DecryptFail,
            IntegrityCode::ChecksumMismatch,
            IntegrityCode::JsonDecodeFail,
            IntegrityCode::WrongKeyManifestMismatch,
        ];
        for code in codes {
            assert_ne!(code.state(), IntegrityState::Valid, "{code}");
            assert!(!IntegrityResult::failure("x", code).is_valid());
        }
    }

    #[test]
    fn codes_serialize_as_screaming_names() {
        let json = serde_json::to_string(&IntegrityCode::ChecksumMismatch).expect("serialize");
        assert_eq!(json, "\"CHECKSUM_MISMATCH\"");
        assert_eq!(
            IntegrityCode::WrongKeyManifestMismatch.as_str(),
            "WRONG_KEY_MANIFEST_MISMATCH"
        );
        assert_eq!(IntegrityState::Unreadable.to_string(), "UNREADABLE");
    }
}
