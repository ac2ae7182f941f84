//! Shard discovery and routing lookups.
//!
//! A catalog is built by listing the shard directory, opening every
//! `message_<n>.db` through the pool, reading its start-time marker and
//! listing its conversation tables. Shards are ordered by start time; each
//! one ends where the next begins and the newest ends an hour from now.
//!
//! Rescans build a complete new state and swap it in, so readers always see
//! either the old catalog or the new one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use shardlog_crypto::hash::conversation_hash;
use shardlog_types::{now_unix, ConversationHash, ShardInfo, UnixSeconds, NEWEST_SHARD_MARGIN_SECS};
use shardlog_vfs::ShardAccess;

use crate::pool::{PooledConnection, ShardPool};
use crate::{queries, CatalogError, Result};

/// File names treated as message shards.
pub const SHARD_FILE_PATTERN: &str = r"^message_([0-9]?[0-9])?\.db$";

/// Whether `name` matches [`SHARD_FILE_PATTERN`].
pub fn is_shard_file_name(name: &str) -> bool {
    let Some(digits) = name.strip_prefix("message_").and_then(|rest| rest.strip_suffix(".db")) else {
        return false;
    };
    digits.len() <= 2 && digits.bytes().all(|b| b.is_ascii_digit())
}

/// One discovered shard file.
#[derive(Clone, Debug)]
pub struct Shard {
    /// File stem, e.g. `message_3`.
    pub id: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub index_path: PathBuf,
    pub start_time: UnixSeconds,
    pub end_time: UnixSeconds,
    pub conversations: HashSet<ConversationHash>,
}

impl Shard {
    pub fn info(&self) -> ShardInfo {
        ShardInfo {
            id: self.id.clone(),
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            index_path: self.index_path.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            conversation_count: self.conversations.len(),
        }
    }

    pub fn contains(&self, hash: &ConversationHash) -> bool {
        self.conversations.contains(hash)
    }

    /// Whether `[start_time, end_time]` intersects `[start, end]`.
    pub fn overlaps(&self, start: UnixSeconds, end: UnixSeconds) -> bool {
        !(self.end_time < start || self.start_time > end)
    }

    fn covers(&self, time: UnixSeconds) -> bool {
        self.start_time <= time && time < self.end_time
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    /// Ascending by start time.
    shards: Vec<Arc<Shard>>,
    /// Newest shard holding each conversation.
    owners: HashMap<ConversationHash, usize>,
}

/// Result of [`ShardCatalog::rescan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescanOutcome {
    Replaced { shards: usize },
    /// The scan found fewer shards than the live catalog; the live catalog
    /// was kept.
    KeptPrevious { previous: usize, found: usize },
}

struct ShardScan {
    path: PathBuf,
    start_time: UnixSeconds,
    conversations: HashSet<ConversationHash>,
}

pub struct ShardCatalog {
    root: PathBuf,
    shard_dir: PathBuf,
    pool: ShardPool,
    state: RwLock<Arc<CatalogState>>,
    rescan_lock: Mutex<()>,
}

impl ShardCatalog {
    /// Discover the shards under `shard_dir`, opening them with `access`.
    ///
    /// `root` is the archive root; per-shard index paths live under it.
    pub fn open(root: impl Into<PathBuf>, shard_dir: impl Into<PathBuf>, access: Arc<dyn ShardAccess>) -> Result<Self> {
        Self::with_pool(root, shard_dir, ShardPool::new(access))
    }

    pub fn with_pool(root: impl Into<PathBuf>, shard_dir: impl Into<PathBuf>, pool: ShardPool) -> Result<Self> {
        let catalog = Self {
            root: root.into(),
            shard_dir: shard_dir.into(),
            pool,
            state: RwLock::new(Arc::new(CatalogState::default())),
            rescan_lock: Mutex::new(()),
        };
        catalog.rescan()?;
        Ok(catalog)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_dir(&self) -> &Path {
        &self.shard_dir
    }

    pub fn pool(&self) -> &ShardPool {
        &self.pool
    }

    /// Rebuild the catalog from disk and swap it in.
    pub fn rescan(&self) -> Result<RescanOutcome> {
        let _guard = self.rescan_lock.lock();
        let next = self.discover()?;

        let previous = self.state.read().shards.len();
        let found = next.shards.len();
        if previous > 0 && found < previous {
            tracing::warn!(previous, found, dir = %self.shard_dir.display(), "shard count decreased, keeping current catalog");
            return Ok(RescanOutcome::KeptPrevious { previous, found });
        }

        let live: HashSet<&Path> = next.shards.iter().map(|s| s.file_path.as_path()).collect();
        for path in self.pool.paths() {
            if !live.contains(path.as_path()) {
                self.pool.evict(&path);
            }
        }

        *self.state.write() = Arc::new(next);
        tracing::info!(shards = found, dir = %self.shard_dir.display(), "shard catalog rebuilt");
        Ok(RescanOutcome::Replaced { shards: found })
    }

    /// React to a shard file being created or replaced on disk.
    pub fn handle_created(&self, path: &Path) -> Result<RescanOutcome> {
        tracing::info!(path = %path.display(), "shard file created");
        self.pool.evict(path);
        self.rescan()
    }

    fn snapshot(&self) -> Arc<CatalogState> {
        Arc::clone(&self.state.read())
    }

    /// Shards ordered by start time.
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.snapshot().shards.clone()
    }

    pub fn list_shards(&self) -> Vec<ShardInfo> {
        self.snapshot().shards.iter().map(|s| s.info()).collect()
    }

    /// Every conversation hash present in any shard, sorted.
    pub fn conversation_hashes(&self) -> Vec<ConversationHash> {
        let mut hashes: Vec<_> = self.snapshot().owners.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Shards overlapping `[start, end]` that hold at least one of `hashes`,
    /// ascending by start time.
    pub fn locate(&self, hashes: &[ConversationHash], start: UnixSeconds, end: UnixSeconds) -> Vec<Arc<Shard>> {
        self.snapshot()
            .shards
            .iter()
            .filter(|shard| shard.overlaps(start, end) && hashes.iter().any(|h| shard.contains(h)))
            .cloned()
            .collect()
    }

    /// The shard holding `talker`'s message at `time`.
    ///
    /// Prefers a shard that holds the conversation and covers `time`, then
    /// the newest shard holding the conversation, then any shard covering
    /// `time`.
    pub fn locate_single(&self, talker: &str, time: UnixSeconds) -> Result<Arc<Shard>> {
        let hash = conversation_hash(talker);
        let state = self.snapshot();

        if let Some(shard) = state.shards.iter().find(|s| s.contains(&hash) && s.covers(time)) {
            return Ok(Arc::clone(shard));
        }
        if let Some(shard) = state.owners.get(&hash).and_then(|&i| state.shards.get(i)) {
            return Ok(Arc::clone(shard));
        }
        state
            .shards
            .iter()
            .find(|s| s.covers(time))
            .cloned()
            .ok_or_else(|| CatalogError::ShardNotFound(talker.to_string()))
    }

    /// Connection checked out of the pool for `shard`.
    pub fn connection(&self, shard: &Shard) -> Result<PooledConnection> {
        self.pool.get(&shard.file_path)
    }

    /// See [`ShardPool::classify`].
    pub fn classify(&self, shard: &Shard, err: CatalogError) -> CatalogError {
        self.pool.classify(&shard.file_path, err)
    }

    fn discover(&self) -> Result<CatalogState> {
        let unavailable = |source| CatalogError::CatalogUnavailable {
            path: self.shard_dir.clone(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.shard_dir).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            let name = entry.file_name();
            if name.to_str().is_some_and(is_shard_file_name) && entry.path().is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let attempted = paths.len();
        let mut scans = Vec::with_capacity(attempted);
        let mut decrypt_failures = Vec::new();
        for path in paths {
            match self.scan_shard(&path) {
                Ok(scan) => scans.push(scan),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping shard");
                    if err.is_decrypt_failure() {
                        decrypt_failures.push(path.clone());
                    }
                    self.pool.evict(&path);
                }
            }
        }

        if scans.is_empty() && attempted > 0 && decrypt_failures.len() == attempted {
            let first = decrypt_failures.swap_remove(0);
            return Err(CatalogError::CannotDecrypt(first));
        }

        Ok(self.build_state(scans))
    }

    fn scan_shard(&self, path: &Path) -> Result<ShardScan> {
        let conn = self.pool.get(path)?;
        let start_time = queries::start_time(&conn).map_err(|err| self.pool.classify(path, err))?;
        let conversations: HashSet<_> = queries::conversations(&conn)
            .map_err(|err| self.pool.classify(path, err))?
            .into_iter()
            .collect();
        tracing::debug!(path = %path.display(), start_time, conversations = conversations.len(), "shard scanned");
        Ok(ShardScan {
            path: path.to_path_buf(),
            start_time,
            conversations,
        })
    }

    fn build_state(&self, mut scans: Vec<ShardScan>) -> CatalogState {
        scans.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.path.cmp(&b.path)));

        let newest_end = now_unix() + NEWEST_SHARD_MARGIN_SECS;
        let ends: Vec<UnixSeconds> = scans
            .iter()
            .skip(1)
            .map(|next| next.start_time)
            .chain(std::iter::once(newest_end))
            .collect();

        let mut state = CatalogState::default();
        for (i, (scan, end_time)) in scans.into_iter().zip(ends).enumerate() {
            let file_name = scan
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = scan
                .path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for hash in &scan.conversations {
                state.owners.insert(*hash, i);
            }
            state.shards.push(Arc::new(Shard {
                index_path: self.root.join("indexes").join("messages").join(format!("{id}.fts.db")),
                id,
                file_name,
                file_path: scan.path,
                start_time: scan.start_time,
                end_time,
                conversations: scan.conversations,
            }));
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{shard_db, FixtureMessage};
    use rusqlite::Connection;
    use shardlog_vfs::CopyAccess;

    fn copy_access() -> Arc<dyn ShardAccess> {
        Arc::new(CopyAccess::temp().expect("copy access"))
    }

    fn three_shards(dir: &Path) {
        shard_db(
            &dir.join("message_0.db"),
            1_000,
            &[FixtureMessage::text("alice", 1, 1_100, "alice", "a1")],
        );
        shard_db(
            &dir.join("message_1.db"),
            2_000,
            &[
                FixtureMessage::text("alice", 2, 2_100, "alice", "a2"),
                FixtureMessage::text("bob", 1, 2_200, "bob", "b1"),
            ],
        );
        shard_db(
            &dir.join("message_2.db"),
            3_000,
            &[FixtureMessage::text("carol", 1, 3_100, "carol", "c1")],
        );
    }

    #[test]
    fn test_shard_file_names() {
        let re = regex::Regex::new(SHARD_FILE_PATTERN).expect("pattern");
        for name in [
            "message_0.db",
            "message_12.db",
            "message_.db",
            "message_123.db",
            "message_fts.db",
            "message_0.db-wal",
            "contact.db",
            "xmessage_1.db",
        ] {
            assert_eq!(is_shard_file_name(name), re.is_match(name), "{name}");
        }
        assert!(is_shard_file_name("message_7.db"));
        assert!(!is_shard_file_name("message_123.db"));
    }

    #[test]
    fn test_discovery_orders_and_assigns_end_times() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        std::fs::write(dir.path().join("contact.db"), b"ignored").expect("write");

        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");
        let shards = catalog.list_shards();
        assert_eq!(shards.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["message_0", "message_1", "message_2"]);
        assert_eq!(shards[0].end_time, 2_000);
        assert_eq!(shards[1].end_time, 3_000);
        assert!(shards[2].end_time >= now_unix() + NEWEST_SHARD_MARGIN_SECS - 5);
        assert_eq!(shards[1].conversation_count, 2);
        assert_eq!(
            shards[0].index_path,
            dir.path().join("indexes").join("messages").join("message_0.fts.db")
        );
        assert_eq!(catalog.conversation_hashes().len(), 3);
    }

    #[test]
    fn test_shard_without_marker_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        let broken = Connection::open(dir.path().join("message_9.db")).expect("open");
        broken.execute_batch("CREATE TABLE Other (x INTEGER);").expect("schema");
        drop(broken);

        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");
        assert_eq!(catalog.shards().len(), 3);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let err = ShardCatalog::open(dir.path(), &missing, copy_access()).err().expect("error");
        assert!(matches!(err, CatalogError::CatalogUnavailable { .. }));
    }

    #[test]
    fn test_empty_directory_has_no_shards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");
        assert!(catalog.shards().is_empty());
        assert!(catalog.locate(&[conversation_hash("alice")], 0, i64::MAX).is_empty());
    }

    #[test]
    fn test_locate_by_time_and_conversation() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");
        let alice = conversation_hash("alice");

        let ids = |shards: Vec<Arc<Shard>>| shards.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(catalog.locate(&[alice], 0, i64::MAX)), ["message_0", "message_1"]);
        assert_eq!(ids(catalog.locate(&[alice], 2_500, 2_600)), ["message_1"]);
        assert_eq!(
            ids(catalog.locate(&[alice, conversation_hash("carol")], 0, i64::MAX)),
            ["message_0", "message_1", "message_2"]
        );
        assert!(catalog.locate(&[conversation_hash("dave")], 0, i64::MAX).is_empty());
    }

    #[test]
    fn test_locate_single() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");

        assert_eq!(catalog.locate_single("alice", 1_100).expect("covering").id, "message_0");
        assert_eq!(catalog.locate_single("alice", 9_999_999_999).expect("owner").id, "message_1");
        assert_eq!(catalog.locate_single("dave", 3_500).expect("by time").id, "message_2");
        assert!(matches!(
            catalog.locate_single("dave", 10),
            Err(CatalogError::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_new_shard_updates_previous_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");

        let path = dir.path().join("message_3.db");
        shard_db(&path, 4_000, &[FixtureMessage::text("alice", 3, 4_100, "alice", "a3")]);
        let outcome = catalog.handle_created(&path).expect("rescan");
        assert_eq!(outcome, RescanOutcome::Replaced { shards: 4 });

        let shards = catalog.list_shards();
        assert_eq!(shards[2].end_time, 4_000);
        assert_eq!(catalog.locate(&[conversation_hash("alice")], 4_000, 5_000).len(), 1);
    }

    #[test]
    fn test_fewer_shards_keeps_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        three_shards(dir.path());
        let catalog = ShardCatalog::open(dir.path(), dir.path(), copy_access()).expect("catalog");

        std::fs::remove_file(dir.path().join("message_2.db")).expect("remove");
        let outcome = catalog.rescan().expect("rescan");
        assert_eq!(outcome, RescanOutcome::KeptPrevious { previous: 3, found: 2 });
        assert_eq!(catalog.shards().len(), 3);
    }
}
