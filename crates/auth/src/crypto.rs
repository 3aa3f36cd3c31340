//! AES-256-GCM encryption at rest for stored Router LLM API keys (§4.7, §9).
//!
//! The key is process-configuration only — never derived from the database —
//! so a decrypt failure at router-invocation time means the configured key
//! changed or the ciphertext is corrupt, not a missing-row case. Callers
//! should treat that as a logged configuration error, not silently skip the
//! router.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("encryption key is not valid base64 or hex")]
    BadKeyEncoding,
    #[error("ciphertext is malformed or truncated")]
    MalformedCiphertext,
    #[error("decryption failed: key mismatch or corrupted data")]
    DecryptFailed,
}

/// A 32-byte AES-256-GCM key, held in a zeroizing buffer.
pub struct EncryptionKey([u8; 32]);

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl EncryptionKey {
    /// Parse a key from the `ENCRYPTION_KEY` environment value, accepting
    /// either base64 or hex encoding of 32 raw bytes.
    pub fn from_config_str(raw: &str) -> Result<Self, CryptoError> {
        let bytes = decode_base64(raw)
            .or_else(|| decode_hex(raw))
            .ok_or(CryptoError::BadKeyEncoding)?;
        let len = bytes.len();
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKeyLength(len))?;
        Ok(Self(arr))
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .expect("AES-GCM encryption with a fixed 32-byte key and fresh nonce cannot fail");
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt a buffer produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        const NONCE_LEN: usize = 12;
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s.trim()).ok()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
