//! # shardlog-crypto
//!
//! Page codec for encrypted archive shards.
//!
//! Every shard is a SQLite database whose pages are individually encrypted
//! with AES-256-CBC and authenticated with an HMAC stored in the page's
//! reserved trailer. The first 16 bytes of the file hold the KDF salt.
//!
//! ## Modules
//!
//! - [`profile`] — Per platform/version cipher parameters
//! - [`kdf`] — PBKDF2 derivation of the page encryption and MAC keys
//! - [`page`] — Page decryption, encryption and key validation
//! - [`hash`] — Conversation identifier digests

pub mod hash;
pub mod kdf;
pub mod page;
pub mod profile;

pub use kdf::{derive_keys, PageKeys, KEY_SIZE};
pub use page::{decrypt_page, encrypt_page, validate_key};
pub use profile::{CipherProfile, HmacDigest};

/// Error types for page codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Stored page tag does not match; wrong key or corrupted page.
    #[error("page {page} failed authentication")]
    AuthenticationFailed { page: u64 },

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Page buffer does not match the profile's page size.
    #[error("invalid page size: expected {expected}, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Block cipher failure.
    #[error("cipher error: {0}")]
    Cipher(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
