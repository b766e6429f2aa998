//! String codec backed by AES-256-GCM.
//!
//! Secrets are encrypted one string at a time. The wire form is
//! `base64(nonce || ciphertext)` with a fresh 96-bit nonce per value, so
//! equal plaintexts never produce equal ciphertexts. The per-row
//! `encryption_status` column, not the value shape, decides whether a
//! column needs decryption on load.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::{CryptoError, CryptoResult};

const NONCE_LEN: usize = 12;

/// Symmetric string codec.
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    /// Build a codec from exactly 32 bytes of key material.
    pub fn new(key_bytes: &[u8]) -> CryptoResult<Self> {
        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes of key material, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    /// Build a codec by hashing an operator-supplied passphrase to 32 bytes.
    pub fn from_passphrase(passphrase: &str) -> CryptoResult<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::InvalidKey("passphrase is empty".to_string()));
        }
        let mut key_bytes = Sha256::digest(passphrase.as_bytes()).to_vec();
        let codec = Self::new(&key_bytes);
        key_bytes.zeroize();
        codec
    }

    /// Encrypt a secret string.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    /// Decrypt a string previously produced by [`Codec::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> CryptoResult<String> {
        let packed = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::Decrypt(format!("invalid base64: {}", e)))?;
        if packed.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decrypt(format!("plaintext is not utf-8: {}", e)))
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").field("key", &"[REDACTED]").finish()
    }
}

static GLOBAL_CODEC: Lazy<RwLock<Option<Codec>>> = Lazy::new(|| RwLock::new(None));

/// Initialize the process-wide codec from a passphrase. Call once at boot.
pub fn init(passphrase: &str) -> CryptoResult<()> {
    install(Codec::from_passphrase(passphrase)?)
}

/// Install a pre-built codec. Tests use this to inject a fixture key.
pub fn install(codec: Codec) -> CryptoResult<()> {
    let mut slot = GLOBAL_CODEC.write();
    if slot.is_some() {
        return Err(CryptoError::AlreadyInitialized);
    }
    *slot = Some(codec);
    Ok(())
}

/// Remove the installed codec. Tests call this on teardown.
pub fn reset() {
    *GLOBAL_CODEC.write() = None;
}

/// Whether a codec is installed. When false, save hooks pass rows through
/// unencrypted with `encryption_status = plain_text`.
pub fn is_enabled() -> bool {
    GLOBAL_CODEC.read().is_some()
}

/// Encrypt through the process-wide codec.
pub fn encrypt(plaintext: &str) -> CryptoResult<String> {
    GLOBAL_CODEC
        .read()
        .as_ref()
        .ok_or(CryptoError::NotInitialized)?
        .encrypt(plaintext)
}

/// Decrypt through the process-wide codec.
pub fn decrypt(encoded: &str) -> CryptoResult<String> {
    GLOBAL_CODEC
        .read()
        .as_ref()
        .ok_or(CryptoError::NotInitialized)?
        .decrypt(encoded)
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)
}

/// The codec is process-wide, so unit tests that install, use, or reset it
/// serialize on this guard to keep parallel tests deterministic.
#[cfg(test)]
pub(crate) fn test_guard() -> parking_lot::MutexGuard<'static, ()> {
    static GUARD: Lazy<parking_lot::Mutex<()>> = Lazy::new(|| parking_lot::Mutex::new(()));
    GUARD.lock()
}
