//! # shardlog-vfs
//!
//! Read-only SQLite storage layer over encrypted shard files.
//!
//! SQLite asks the VFS for byte ranges; this crate maps them onto whole
//! pages, decrypts and authenticates each page once, and keeps the result in
//! a small per-file LRU cache. Nothing decrypted is ever written to disk.
//!
//! ## Modules
//!
//! - [`registry`] — Path to key parameter table consulted on open
//! - [`cache`] — Bounded LRU of decrypted pages
//! - [`file`] — Byte-range reads over decrypted pages
//! - [`sqlite`] — The `sqlite3_vfs` registered with SQLite
//! - [`access`] — Strategies for opening a shard as a `rusqlite::Connection`

pub mod access;
pub mod cache;
pub mod file;
pub mod registry;
pub mod sqlite;

use std::path::PathBuf;

pub use access::{CopyAccess, PlaintextSource, ShardAccess, TempCopySource, VfsAccess};
pub use cache::{CacheStats, PageCache, DEFAULT_CACHE_PAGES};
pub use file::VirtualFile;
pub use registry::{KeyParameters, KeyRegistry};
pub use sqlite::ShardVfs;

/// Storage layer error types.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// No key parameters registered for the path.
    #[error("no key registered for {0}")]
    NoKey(PathBuf),

    #[error("cannot open {path}: {source}")]
    CannotOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Pages failed authentication; almost always a wrong key.
    #[error("cannot decrypt {0}: wrong key or corrupted file")]
    CannotDecrypt(PathBuf),

    #[error("crypto error: {0}")]
    Crypto(#[from] shardlog_crypto::CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("VFS registration failed: {0}")]
    Register(String),
}

pub type Result<T> = std::result::Result<T, VfsError>;
