//! Fixtures for the shardlog integration tests.
//!
//! Shards are written the way the producing client writes them: a normal
//! SQLite file with the profile's page size and reserved trailer, then every
//! page encrypted in place with a random salt and per-page IVs.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p shardlog-integration-tests
//! ```

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use rusqlite::{ffi, params, Connection};
use shardlog_catalog::{MessageRouter, ShardCatalog};
use shardlog_crypto::hash::conversation_hash;
use shardlog_crypto::{derive_keys, encrypt_page, CipherProfile, KEY_SIZE};
use shardlog_vfs::{KeyParameters, ShardAccess, VfsAccess};

/// Key used by every fixture archive unless a test says otherwise.
pub const TEST_KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

/// Profile with no key stretching, so fixtures stay fast.
pub const FAST_PROFILE: CipherProfile = CipherProfile::MacosV3;

/// One row of a fixture shard.
#[derive(Clone, Debug)]
pub struct Row {
    pub talker: String,
    pub seq: i64,
    pub time: i64,
    pub sender: String,
    pub status: i64,
    pub content: String,
}

impl Row {
    pub fn new(talker: &str, seq: i64, time: i64, content: &str) -> Self {
        Self {
            talker: talker.to_string(),
            seq,
            time,
            sender: talker.to_string(),
            status: 3,
            content: content.to_string(),
        }
    }

    pub fn from_self(mut self) -> Self {
        self.sender = "me".to_string();
        self.status = 2;
        self
    }
}

/// Rows `seqs` for `talker`, one minute apart from `first_time`.
pub fn rows(talker: &str, seqs: std::ops::RangeInclusive<i64>, first_time: i64) -> Vec<Row> {
    seqs.enumerate()
        .map(|(i, seq)| Row::new(talker, seq, first_time + 60 * i as i64, &format!("{talker} message {seq}")))
        .collect()
}

/// An archive directory under construction.
pub struct Archive {
    pub dir: tempfile::TempDir,
    pub profile: CipherProfile,
    pub key: [u8; KEY_SIZE],
}

impl Archive {
    pub fn new(profile: CipherProfile) -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            profile,
            key: TEST_KEY,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `message_<n>.db` encrypted with the archive key.
    pub fn add_shard(&self, n: u32, start_time: i64, rows: &[Row]) -> PathBuf {
        let path = self.path().join(format!("message_{n}.db"));
        write_encrypted_shard(&path, self.profile, &self.key, start_time, rows);
        path
    }

    pub fn key_parameters(&self) -> KeyParameters {
        KeyParameters::new(self.key, self.profile)
    }

    /// Catalog over the archive with in-place decryption using `key`.
    pub fn catalog_with_key(&self, key: [u8; KEY_SIZE]) -> shardlog_catalog::Result<Arc<ShardCatalog>> {
        let access: Arc<dyn ShardAccess> = Arc::new(VfsAccess::new(KeyParameters::new(key, self.profile), 16)?);
        Ok(Arc::new(ShardCatalog::open(self.path(), self.path(), access)?))
    }

    pub fn router(&self) -> MessageRouter {
        MessageRouter::new(self.catalog_with_key(self.key).expect("catalog"))
    }

    /// Zero-based index of `table`'s root page in `shard`, read through the VFS.
    pub fn root_page_index(&self, shard: &Path, table: &str) -> u64 {
        let access = VfsAccess::new(self.key_parameters(), 16).expect("vfs access");
        let conn = access.open(shard).expect("open shard");
        let root: i64 = conn
            .query_row("SELECT rootpage FROM sqlite_master WHERE name = ?1", [table], |row| row.get(0))
            .expect("root page");
        (root - 1) as u64
    }

    /// Flip one ciphertext byte inside page `index` of `shard`.
    pub fn corrupt_page(&self, shard: &Path, index: u64) {
        let mut raw = std::fs::read(shard).expect("read shard");
        let offset = index as usize * self.profile.page_size() + 64;
        raw[offset] ^= 0x01;
        std::fs::write(shard, raw).expect("write shard");
    }
}

/// Write a plaintext shard laid out for `profile` (page size and reserve).
pub fn write_plain_shard(path: &Path, profile: CipherProfile, start_time: i64, rows: &[Row]) {
    let conn = Connection::open(path).expect("open plain shard");
    let mut reserve = profile.reserve() as c_int;
    // SAFETY: live connection; the reserve must be set before the first page is written.
    let rc = unsafe {
        ffi::sqlite3_file_control(
            conn.handle(),
            b"main\0".as_ptr() as *const c_char,
            ffi::SQLITE_FCNTL_RESERVE_BYTES,
            &mut reserve as *mut c_int as *mut c_void,
        )
    };
    assert_eq!(rc, ffi::SQLITE_OK, "reserve bytes");

    conn.execute_batch(&format!(
        "PRAGMA page_size = {};
         PRAGMA journal_mode = DELETE;
         CREATE TABLE Timestamp (timestamp INTEGER);
         CREATE TABLE Name2Id (user_name TEXT UNIQUE);",
        profile.page_size()
    ))
    .expect("base schema");
    conn.execute("INSERT INTO Timestamp (timestamp) VALUES (?1)", [start_time])
        .expect("timestamp");

    let mut sender_ids = BTreeMap::new();
    for row in rows {
        if !sender_ids.contains_key(&row.sender) {
            conn.execute("INSERT INTO Name2Id (user_name) VALUES (?1)", [&row.sender])
                .expect("name2id");
            sender_ids.insert(row.sender.clone(), conn.last_insert_rowid());
        }
        let table = conversation_hash(&row.talker).table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER,
                local_type INTEGER,
                sort_seq INTEGER,
                real_sender_id INTEGER,
                create_time INTEGER,
                status INTEGER,
                message_content TEXT,
                packed_info_data BLOB
            );"
        ))
        .expect("message table");
        conn.execute(
            &format!(
                "INSERT INTO \"{table}\" (server_id, local_type, sort_seq, real_sender_id, create_time, status, message_content)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![row.seq * 1000, row.seq, sender_ids[&row.sender], row.time, row.status, row.content],
        )
        .expect("message row");
    }
}

/// Write a shard and encrypt it page by page with `key`.
pub fn write_encrypted_shard(path: &Path, profile: CipherProfile, key: &[u8; KEY_SIZE], start_time: i64, rows: &[Row]) {
    let staging = tempfile::tempdir().expect("staging dir");
    let plain_path = staging.path().join("plain.db");
    write_plain_shard(&plain_path, profile, start_time, rows);
    let plain = std::fs::read(&plain_path).expect("read plain shard");
    std::fs::write(path, encrypt_database(&plain, profile, key)).expect("write encrypted shard");
}

/// Encrypt a whole plaintext database image.
pub fn encrypt_database(plain: &[u8], profile: CipherProfile, key: &[u8; KEY_SIZE]) -> Vec<u8> {
    let page_size = profile.page_size();
    assert_eq!(plain.len() % page_size, 0, "database is not page aligned");
    assert_eq!(plain[20] as usize, profile.reserve(), "reserve not applied");

    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 16];
    rng.fill_bytes(&mut salt);
    let keys = derive_keys(key, &salt, profile);

    let mut out = Vec::with_capacity(plain.len());
    for (index, page) in plain.chunks(page_size).enumerate() {
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);
        out.extend(encrypt_page(page, index as u64, &keys, profile, &salt, &iv).expect("encrypt page"));
    }
    out
}

/// Sequence numbers of `messages`, in order.
pub fn seqs(messages: &[shardlog_types::Message]) -> Vec<i64> {
    messages.iter().map(|m| m.seq).collect()
}
