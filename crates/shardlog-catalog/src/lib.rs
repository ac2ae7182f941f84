//! # shardlog-catalog
//!
//! Discovery and query routing across time-sharded message databases.
//!
//! An archive keeps its messages in `message_<n>.db` files, each covering a
//! time range and holding one `Msg_<hash>` table per conversation. The
//! catalog maps conversations and times to shards; the router fans logical
//! queries out to the right shards and merges the results in `sort_seq`
//! order.
//!
//! ## Modules
//!
//! - [`catalog`] — Shard discovery, rescans and routing lookups
//! - [`pool`] — Per-shard connection pools, with delayed release
//! - [`queries`] — SQL run against a single shard
//! - [`decode`] — Row to [`shardlog_types::Message`] conversion
//! - [`router`] — Fan-out, merge and pagination
//! - [`cancel`] — Cooperative cancellation
//! - [`watcher`] — Rescans when new shard files appear

pub mod cancel;
pub mod catalog;
pub mod decode;
pub mod pool;
pub mod queries;
pub mod router;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::PathBuf;

use shardlog_vfs::VfsError;

pub use cancel::CancelToken;
pub use catalog::{RescanOutcome, Shard, ShardCatalog, SHARD_FILE_PATTERN};
pub use pool::{PooledConnection, ShardPool, DEFAULT_RELEASE_GRACE, MAX_IDLE_PER_SHARD};
pub use router::MessageRouter;
pub use watcher::ShardWatcher;

/// Catalog and routing error types.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The shard directory could not be listed.
    #[error("shard directory {path} unavailable: {source}")]
    CatalogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no shard holds messages for {0}")]
    ShardNotFound(String),

    /// An expected table or column is missing from a shard.
    #[error("schema drift in {shard}: {detail}")]
    SchemaDrift { shard: PathBuf, detail: String },

    #[error("no conversation given")]
    EmptyTalker,

    #[error("invalid keyword pattern: {0}")]
    InvalidKeyword(#[from] regex::Error),

    /// Every candidate shard failed authentication.
    #[error("cannot decrypt {0}: wrong key or corrupted archive")]
    CannotDecrypt(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Vfs(#[from] VfsError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Whether the error means the key does not fit the data.
    pub fn is_decrypt_failure(&self) -> bool {
        match self {
            CatalogError::CannotDecrypt(_) | CatalogError::Vfs(VfsError::CannotDecrypt(_)) => true,
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::NotADatabase
            }
            _ => false,
        }
    }

    /// Whether SQLite reported a missing table.
    pub fn is_missing_table(&self) -> bool {
        match self {
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) => msg.contains("no such table"),
            CatalogError::SchemaDrift { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
