//! Payload encryption.
//!
//! SQL text travels through the queue encrypted, and status events are
//! encrypted before they are published. Ciphertext is `base64(nonce || ct)`.

use crate::error::{Result, ShellQueryError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric encryption of text payloads.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext` into a transport-safe string.
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Decrypts a string produced by [`Cipher::encrypt`].
    ///
    /// Returns `Ok(None)` for an empty payload.
    fn decrypt(&self, ciphertext: &str) -> Result<Option<String>>;
}

/// AES-256-GCM with a random 96-bit nonce per message.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    /// Creates a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(ShellQueryError::config(format!(
                "Encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Creates a cipher from a base64-encoded key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ShellQueryError::config(format!("Encryption key is not base64: {e}")))?;
        Self::new(&key)
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ShellQueryError::crypto("Encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Option<String>> {
        let trimmed = ciphertext.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let raw = STANDARD
            .decode(trimmed)
            .map_err(|e| ShellQueryError::crypto(format!("Ciphertext is not base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(ShellQueryError::crypto("Ciphertext is too short"));
        }

        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| ShellQueryError::crypto("Decryption failed"))?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| ShellQueryError::crypto("Decrypted payload is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap()
    }

    #[test]
    fn test_json_payload_survives_encryption() {
        let cipher = cipher();
        let payload = r#"{"status":"ready","message":"Query completed","runId":"r-1"}"#;
        let sealed = cipher.encrypt(payload).unwrap();
        assert_ne!(sealed, payload);
        assert_eq!(cipher.decrypt(&sealed).unwrap().as_deref(), Some(payload));
    }

    #[test]
    fn test_nonce_differs_per_message() {
        let cipher = cipher();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_empty_payload_is_none() {
        assert_eq!(cipher().decrypt("  ").unwrap(), None);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().encrypt("SELECT 1").unwrap();
        assert!(matches!(
            cipher().decrypt(&sealed),
            Err(ShellQueryError::Crypto(_))
        ));
    }

    #[test]
    fn test_garbage_fails() {
        let cipher = cipher();
        assert!(cipher.decrypt("not base64!!").is_err());
        assert!(cipher.decrypt("AAAA").is_err());
    }

    #[test]
    fn test_key_length_checked() {
        assert!(AesGcmCipher::new(&[0u8; 16]).is_err());
        assert!(AesGcmCipher::from_base64_key("c2hvcnQ=").is_err());
    }
}
