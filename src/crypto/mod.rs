//! # Secret Encryption
//!
//! Envelope encryption of secret strings at rest. A process-wide codec is
//! initialized once with a symmetric key; row lifecycle hooks call through
//! it to encrypt on save and decrypt on load. When no key is configured the
//! codec is disabled and rows are stored as `plain_text`.

use thiserror::Error;

/// Crypto error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Codec used before a key was installed
    #[error("encryption codec is not initialized")]
    NotInitialized,

    /// Codec initialized twice
    #[error("encryption codec is already initialized")]
    AlreadyInitialized,

    /// Key material has the wrong shape
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// AEAD encryption failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// AEAD decryption or ciphertext decoding failed
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

pub mod codec;

pub use codec::{decrypt, encrypt, init, install, is_enabled, reset, sha256_hex, Codec};
