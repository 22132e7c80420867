use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chats_core::integrity::IntegrityCode;
use sha2::{Digest, Sha256};

use crate::key_manager::EncryptionKey;

/// Tag recorded in every wrapper written by this crate.
pub const ENCRYPTION_VERSION: &str = "aes-256-gcm-v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM over whole records. Sealed output is `base64(nonce || ciphertext || tag)`.
pub struct ArchiveCipher {
    inner: Aes256Gcm,
}

impl ArchiveCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            inner: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, aes_gcm::Error> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.inner.encrypt(&nonce, plaintext)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Decode and decrypt; every failure maps to the diagnostic code a verifier reports.
    pub fn open(&self, encryption_version: &str, encoded: &str) -> Result<Vec<u8>, IntegrityCode> {
        if encryption_version != ENCRYPTION_VERSION {
            return Err(IntegrityCode::UnsupportedEncryptionVersion);
        }
        if encoded.is_empty() {
            return Err(IntegrityCode::WrapperNoContent);
        }
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|_| IntegrityCode::WrapperB64DecodeFail)?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(IntegrityCode::CiphertextTooShort);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| IntegrityCode::DecryptFail)
    }
}

/// Hex SHA-256, used for plaintext checksums.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips_and_hides_plaintext() {
        let cipher = ArchiveCipher::new(&EncryptionKey::generate());
        let sealed = cipher.seal(b"hello-archive").expect("seal");
        assert!(!sealed.contains("hello-archive"));
        assert_eq!(
            cipher.open(ENCRYPTION_VERSION, &sealed).expect("open"),
            b"hello-archive"
        );
    }

    #[test]
    fn open_maps_failures_to_codes() {
        let cipher = ArchiveCipher::new(&EncryptionKey::generate());
        let other = ArchiveCipher::new(&EncryptionKey::generate());
        let sealed = cipher.seal(b"payload").expect("seal");

        assert_eq!(
            other.open(ENCRYPTION_VERSION, &sealed),
            Err(IntegrityCode::DecryptFail)
        );
        assert_eq!(
            cipher.open("fernet-v1", &sealed),
            Err(IntegrityCode::UnsupportedEncryptionVersion)
        );
        assert_eq!(
            cipher.open(ENCRYPTION_VERSION, ""),
            Err(IntegrityCode::WrapperNoContent)
        );
        assert_eq!(
            cipher.open(ENCRYPTION_VERSION, "%%%"),
            Err(IntegrityCode::WrapperB64DecodeFail)
        );
        assert_eq!(
            cipher.open(ENCRYPTION_VERSION, &STANDARD.encode([0u8; 8])),
            Err(IntegrityCode::CiphertextTooShort)
        );
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
