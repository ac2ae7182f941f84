//! Per-shard connection pools.
//!
//! Connections are opened lazily through the root's [`ShardAccess`] and
//! checked out one reader at a time; concurrent readers of the same shard get
//! independent connections. Up to [`MAX_IDLE_PER_SHARD`] connections per
//! shard are kept for reuse. Eviction drops the idle connections at once but
//! delays [`ShardAccess::release`] by a grace period, so a key or plaintext
//! copy outlives queries that still hold a checked-out connection.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use shardlog_vfs::ShardAccess;

use crate::{CatalogError, Result};

/// Delay between evicting a shard and releasing its access state.
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Idle connections kept per shard; extra ones close when checked back in.
pub const MAX_IDLE_PER_SHARD: usize = 4;

#[derive(Default)]
struct ShardSlot {
    idle: Mutex<Vec<Connection>>,
}

type SlotMap = HashMap<PathBuf, Arc<ShardSlot>>;

/// A connection checked out of a [`ShardPool`]; returned to its shard's idle
/// set on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    slot: Arc<ShardSlot>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after check-in"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.slot.idle.lock();
            if idle.len() < MAX_IDLE_PER_SHARD {
                idle.push(conn);
            }
        }
    }
}

pub struct ShardPool {
    // Declared before `access` so idle connections close before the access
    // strategy (and its VFS) is dropped.
    slots: Arc<Mutex<SlotMap>>,
    access: Arc<dyn ShardAccess>,
    grace: Duration,
}

impl ShardPool {
    pub fn new(access: Arc<dyn ShardAccess>) -> Self {
        Self::with_grace(access, DEFAULT_RELEASE_GRACE)
    }

    pub fn with_grace(access: Arc<dyn ShardAccess>, grace: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            access,
            grace,
        }
    }

    /// Name of the access strategy, for logs.
    pub fn access_name(&self) -> &'static str {
        self.access.name()
    }

    /// Check out a connection for `path`, reusing an idle one when possible.
    pub fn get(&self, path: &Path) -> Result<PooledConnection> {
        let existing = self.slots.lock().get(path).cloned();
        if let Some(slot) = existing.as_ref() {
            if let Some(conn) = slot.idle.lock().pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    slot: Arc::clone(slot),
                });
            }
        }

        // Opening can be slow (key derivation, copies); keep the map unlocked.
        let conn = self.access.open(path)?;
        tracing::debug!(path = %path.display(), access = self.access.name(), "shard connection opened");

        let slot = match existing {
            Some(slot) => slot,
            None => Arc::clone(self.slots.lock().entry(path.to_path_buf()).or_default()),
        };
        Ok(PooledConnection { conn: Some(conn), slot })
    }

    /// Turn a statement failure on `path` into [`CatalogError::CannotDecrypt`]
    /// when a page failed authentication underneath it.
    pub fn classify(&self, path: &Path, err: CatalogError) -> CatalogError {
        if !err.is_decrypt_failure() && self.access.take_auth_failure(path) {
            tracing::warn!(path = %path.display(), error = %err, "page authentication failed");
            return CatalogError::CannotDecrypt(path.to_path_buf());
        }
        err
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.slots.lock().contains_key(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.slots.lock().keys().cloned().collect()
    }

    /// Idle connections currently kept for `path`.
    pub fn idle(&self, path: &Path) -> usize {
        self.slots.lock().get(path).map_or(0, |slot| slot.idle.lock().len())
    }

    /// Drop the idle connections for `path` and schedule its release.
    ///
    /// The release is skipped if `path` was reopened during the grace period.
    pub fn evict(&self, path: &Path) {
        let stale = self.slots.lock().remove(path);
        tracing::debug!(path = %path.display(), cached = stale.is_some(), "shard evicted");
        if let Some(slot) = &stale {
            slot.idle.lock().clear();
        }

        let slots = Arc::clone(&self.slots);
        let access = Arc::clone(&self.access);
        let grace = self.grace;
        let path = path.to_path_buf();
        let spawned = std::thread::Builder::new()
            .name("shardlog-release".into())
            .spawn(move || {
                std::thread::sleep(grace);
                drop(stale);
                if slots.lock().contains_key(&path) {
                    tracing::debug!(path = %path.display(), "shard reopened during grace period, keeping access state");
                    return;
                }
                access.release(&path);
                tracing::debug!(path = %path.display(), "shard access released");
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "could not spawn release thread");
        }
    }

    /// Close every idle connection and release each shard immediately.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (path, slot) in drained {
            slot.idle.lock().clear();
            drop(slot);
            self.access.release(&path);
        }
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAccess {
        opens: AtomicUsize,
        released: Mutex<Vec<PathBuf>>,
    }

    impl ShardAccess for CountingAccess {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn open(&self, _path: &Path) -> shardlog_vfs::Result<Connection> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::open_in_memory()?)
        }

        fn release(&self, path: &Path) {
            self.released.lock().push(path.to_path_buf());
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_returned_connection_is_reused() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::new(access.clone());
        let path = Path::new("/tmp/message_0.db");

        drop(pool.get(path).expect("first"));
        assert_eq!(pool.idle(path), 1);
        let conn = pool.get(path).expect("second");
        assert_eq!(pool.idle(path), 0);
        assert_eq!(access.opens.load(Ordering::SeqCst), 1);
        drop(conn);
        assert_eq!(pool.idle(path), 1);
    }

    #[test]
    fn test_concurrent_checkouts_get_independent_connections() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::new(access.clone());
        let path = Path::new("/tmp/message_0.db");

        let a = pool.get(path).expect("a");
        let b = pool.get(path).expect("b");
        a.execute_batch("CREATE TEMP TABLE only_a (x INTEGER)").expect("temp table");
        assert!(b.prepare("SELECT x FROM only_a").is_err());
        assert_eq!(access.opens.load(Ordering::SeqCst), 2);

        drop(a);
        drop(b);
        assert_eq!(pool.idle(path), 2);
    }

    #[test]
    fn test_idle_set_is_bounded() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::new(access.clone());
        let path = Path::new("/tmp/message_0.db");

        let held: Vec<_> = (0..MAX_IDLE_PER_SHARD + 2)
            .map(|_| pool.get(path).expect("checkout"))
            .collect();
        drop(held);
        assert_eq!(pool.idle(path), MAX_IDLE_PER_SHARD);
    }

    #[test]
    fn test_failed_open_is_not_cached() {
        struct Failing;
        impl ShardAccess for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn open(&self, path: &Path) -> shardlog_vfs::Result<Connection> {
                Err(shardlog_vfs::VfsError::NoKey(path.to_path_buf()))
            }
        }

        let pool = ShardPool::new(Arc::new(Failing));
        let path = Path::new("/tmp/message_0.db");
        assert!(pool.get(path).is_err());
        assert!(!pool.contains(path));
    }

    #[test]
    fn test_evict_releases_after_grace() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::with_grace(access.clone(), Duration::from_millis(20));
        let path = Path::new("/tmp/message_1.db");
        pool.get(path).expect("open");

        pool.evict(path);
        assert!(!pool.contains(path));
        assert!(wait_for(|| access.released.lock().len() == 1));
        assert_eq!(access.released.lock()[0], path);
    }

    #[test]
    fn test_reopen_during_grace_keeps_state() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::with_grace(access.clone(), Duration::from_millis(50));
        let path = Path::new("/tmp/message_2.db");
        pool.get(path).expect("open");

        pool.evict(path);
        pool.get(path).expect("reopen");
        std::thread::sleep(Duration::from_millis(150));
        assert!(access.released.lock().is_empty());
        assert_eq!(access.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_all_releases_everything() {
        let access = Arc::new(CountingAccess::default());
        let pool = ShardPool::new(access.clone());
        pool.get(Path::new("/tmp/a.db")).expect("a");
        pool.get(Path::new("/tmp/b.db")).expect("b");
        pool.close_all();
        assert!(pool.paths().is_empty());
        assert_eq!(access.released.lock().len(), 2);
    }

    #[test]
    fn test_classify_uses_recorded_auth_failure() {
        struct Tampered(std::sync::atomic::AtomicBool);
        impl ShardAccess for Tampered {
            fn name(&self) -> &'static str {
                "tampered"
            }
            fn open(&self, _path: &Path) -> shardlog_vfs::Result<Connection> {
                Ok(Connection::open_in_memory()?)
            }
            fn take_auth_failure(&self, _path: &Path) -> bool {
                self.0.swap(false, Ordering::SeqCst)
            }
        }

        let pool = ShardPool::new(Arc::new(Tampered(std::sync::atomic::AtomicBool::new(true))));
        let path = Path::new("/tmp/message_0.db");
        let io_error = || {
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR_READ),
                Some("disk I/O error".to_string()),
            ))
        };

        let err = pool.classify(path, io_error());
        assert!(matches!(err, CatalogError::CannotDecrypt(ref p) if p == path), "got {err}");
        let err = pool.classify(path, io_error());
        assert!(matches!(err, CatalogError::Sqlite(_)), "got {err}");
    }
}
