//! Strategies for turning a shard path into a read-only connection.
//!
//! [`VfsAccess`] decrypts in place through the registered VFS. [`CopyAccess`]
//! opens a plaintext copy supplied by a [`PlaintextSource`]. A root picks one
//! strategy when it is opened; `VfsAccess` can carry a second strategy that
//! is tried when the VFS path fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::registry::{KeyParameters, KeyRegistry};
use crate::sqlite::ShardVfs;
use crate::{Result, VfsError};

static VFS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opens shard files as SQLite connections.
pub trait ShardAccess: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open `path` read-only.
    fn open(&self, path: &Path) -> Result<Connection>;

    /// Drop any per-path state once every connection to `path` is closed.
    fn release(&self, _path: &Path) {}

    /// Whether a page of `path` failed authentication since the last call.
    fn take_auth_failure(&self, _path: &Path) -> bool {
        false
    }
}

/// Schema probe run after every open; forces the header and schema pages
/// through decryption.
fn probe(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Decrypt-in-place access through a per-root [`ShardVfs`].
pub struct VfsAccess {
    vfs: ShardVfs,
    key: Arc<KeyParameters>,
    fallback: Option<Box<dyn ShardAccess>>,
}

impl VfsAccess {
    /// Register a fresh VFS for one archive root.
    pub fn new(key: KeyParameters, cache_pages: usize) -> Result<Self> {
        let name = format!("shardlog-{}", VFS_COUNTER.fetch_add(1, Ordering::Relaxed));
        let vfs = ShardVfs::register(&name, Arc::new(KeyRegistry::new()), cache_pages)?;
        Ok(Self {
            vfs,
            key: Arc::new(key),
            fallback: None,
        })
    }

    /// Strategy to try when the VFS cannot open a path.
    pub fn with_fallback(mut self, fallback: Box<dyn ShardAccess>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        self.vfs.registry()
    }

    pub fn vfs(&self) -> &ShardVfs {
        &self.vfs
    }

    fn open_direct(&self, path: &Path) -> Result<Connection> {
        self.registry().register_shared(path, Arc::clone(&self.key));

        let opened = self
            .vfs
            .open(path)
            .and_then(|conn| probe(&conn).map(|_| conn).map_err(VfsError::from));
        match opened {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.registry().unregister(path);
                if self.vfs.take_auth_failure(path) {
                    Err(VfsError::CannotDecrypt(path.to_path_buf()))
                } else {
                    Err(err)
                }
            }
        }
    }
}

impl ShardAccess for VfsAccess {
    fn name(&self) -> &'static str {
        "vfs"
    }

    fn open(&self, path: &Path) -> Result<Connection> {
        let err = match self.open_direct(path) {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };
        let Some(fallback) = &self.fallback else {
            return Err(err);
        };

        tracing::warn!(path = %path.display(), error = %err, fallback = fallback.name(), "vfs open failed, falling back");
        fallback.open(path).map_err(|fallback_err| {
            tracing::warn!(path = %path.display(), error = %fallback_err, "fallback open failed");
            err
        })
    }

    fn release(&self, path: &Path) {
        self.registry().unregister(path);
        if let Some(fallback) = &self.fallback {
            fallback.release(path);
        }
    }

    fn take_auth_failure(&self, path: &Path) -> bool {
        self.vfs.take_auth_failure(path)
    }
}

/// Supplies a plaintext database file for an archive shard.
pub trait PlaintextSource: Send + Sync {
    fn plaintext_path(&self, shard: &Path) -> Result<PathBuf>;

    /// Forget (and delete, if owned) the plaintext for `shard`.
    fn discard(&self, _shard: &Path) {}
}

/// Copies already-plaintext shards into a private temporary directory so
/// the live files are never locked by SQLite.
pub struct TempCopySource {
    dir: tempfile::TempDir,
    copies: Mutex<HashMap<PathBuf, PathBuf>>,
    counter: AtomicU64,
}

impl TempCopySource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("shardlog-").tempdir()?,
            copies: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl PlaintextSource for TempCopySource {
    fn plaintext_path(&self, shard: &Path) -> Result<PathBuf> {
        let file_name = shard
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shard.db".to_string());
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let copy = self.dir.path().join(format!("{n}-{file_name}"));
        std::fs::copy(shard, &copy).map_err(|source| VfsError::CannotOpen {
            path: shard.to_path_buf(),
            source,
        })?;
        tracing::debug!(shard = %shard.display(), copy = %copy.display(), "plaintext copy created");

        if let Some(stale) = self.copies.lock().insert(shard.to_path_buf(), copy.clone()) {
            let _ = std::fs::remove_file(stale);
        }
        Ok(copy)
    }

    fn discard(&self, shard: &Path) {
        if let Some(copy) = self.copies.lock().remove(shard) {
            if let Err(err) = std::fs::remove_file(&copy) {
                tracing::debug!(copy = %copy.display(), error = %err, "could not remove plaintext copy");
            }
        }
    }
}

/// Opens plaintext copies read-only.
pub struct CopyAccess {
    source: Box<dyn PlaintextSource>,
}

impl CopyAccess {
    pub fn new(source: Box<dyn PlaintextSource>) -> Self {
        Self { source }
    }

    /// Copy access backed by a fresh [`TempCopySource`].
    pub fn temp() -> Result<Self> {
        Ok(Self::new(Box::new(TempCopySource::new()?)))
    }
}

impl ShardAccess for CopyAccess {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn open(&self, path: &Path) -> Result<Connection> {
        let plain = self.source.plaintext_path(path)?;
        let conn = Connection::open_with_flags(
            &plain,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        probe(&conn)?;
        Ok(conn)
    }

    fn release(&self, path: &Path) {
        self.source.discard(path);
    }
}
