//! The `sqlite3_vfs` that serves decrypted shard pages to SQLite.
//!
//! One [`ShardVfs`] is registered per archive root under a unique name. Its
//! `pAppData` points at the root's key registry and open-file table. Only
//! main database files can be opened; journals, WAL and temp files are
//! refused, and every file reports `SQLITE_IOCAP_IMMUTABLE` so the pager
//! never asks for locks or rollback journals.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{ffi, Connection, OpenFlags};
use shardlog_crypto::CryptoError;

use crate::file::VirtualFile;
use crate::registry::KeyRegistry;
use crate::{Result, VfsError};

/// Sector size reported to the pager.
pub const SECTOR_SIZE: c_int = 4096;

const MAX_PATHNAME: c_int = 1024;

/// Per-connection file object. SQLite allocates `szOsFile` bytes for it and
/// only ever touches `base`.
#[repr(C)]
struct ShardFile {
    base: ffi::sqlite3_file,
    state: *const VfsState,
    id: u64,
}

struct VfsState {
    name: CString,
    registry: Arc<KeyRegistry>,
    files: RwLock<HashMap<u64, Arc<VirtualFile>>>,
    next_id: AtomicU64,
    cache_pages: usize,
    io_methods: ffi::sqlite3_io_methods,
    auth_failures: Mutex<HashSet<PathBuf>>,
}

impl VfsState {
    fn open_file(&self, path: &Path) -> Result<u64> {
        let params = self.registry.lookup(path)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let file = VirtualFile::open(id, path, &params, self.cache_pages)?;
        self.files.write().insert(id, Arc::new(file));
        Ok(id)
    }

    fn file(&self, id: u64) -> Option<Arc<VirtualFile>> {
        self.files.read().get(&id).cloned()
    }

    fn note_read_failure(&self, path: &Path, err: &VfsError) {
        if matches!(err, VfsError::Crypto(CryptoError::AuthenticationFailed { .. })) {
            self.auth_failures.lock().insert(path.to_path_buf());
        }
    }
}

/// A registered decrypting VFS.
///
/// Connections opened through it must be dropped before it is.
pub struct ShardVfs {
    vfs: Box<ffi::sqlite3_vfs>,
    state: Box<VfsState>,
}

// SAFETY: the sqlite3_vfs struct is never mutated after registration, and all
// mutable state behind pAppData sits behind locks or atomics.
unsafe impl Send for ShardVfs {}
// SAFETY: see above; shared access only reads the registration struct.
unsafe impl Sync for ShardVfs {}

impl ShardVfs {
    /// Register a VFS called `name` backed by `registry`.
    pub fn register(name: &str, registry: Arc<KeyRegistry>, cache_pages: usize) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| VfsError::Register(format!("invalid VFS name {name:?}")))?;

        // SAFETY: sqlite3_io_methods is a plain C struct of integers and
        // nullable function pointers; all-zero is a valid value.
        let mut io_methods: ffi::sqlite3_io_methods = unsafe { mem::zeroed() };
        io_methods.iVersion = 1;
        io_methods.xClose = Some(x_close);
        io_methods.xRead = Some(x_read);
        io_methods.xWrite = Some(x_write);
        io_methods.xTruncate = Some(x_truncate);
        io_methods.xSync = Some(x_sync);
        io_methods.xFileSize = Some(x_file_size);
        io_methods.xLock = Some(x_lock);
        io_methods.xUnlock = Some(x_lock);
        io_methods.xCheckReservedLock = Some(x_check_reserved_lock);
        io_methods.xFileControl = Some(x_file_control);
        io_methods.xSectorSize = Some(x_sector_size);
        io_methods.xDeviceCharacteristics = Some(x_device_characteristics);

        let state = Box::new(VfsState {
            name: c_name,
            registry,
            files: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cache_pages,
            io_methods,
            auth_failures: Mutex::new(HashSet::new()),
        });

        // SAFETY: as above, sqlite3_vfs is valid when zeroed.
        let mut vfs: Box<ffi::sqlite3_vfs> = Box::new(unsafe { mem::zeroed() });
        vfs.iVersion = 2;
        vfs.szOsFile = mem::size_of::<ShardFile>() as c_int;
        vfs.mxPathname = MAX_PATHNAME;
        vfs.zName = state.name.as_ptr();
        vfs.pAppData = &*state as *const VfsState as *mut c_void;
        vfs.xOpen = Some(x_open);
        vfs.xDelete = Some(x_delete);
        vfs.xAccess = Some(x_access);
        vfs.xFullPathname = Some(x_full_pathname);
        vfs.xRandomness = Some(x_randomness);
        vfs.xSleep = Some(x_sleep);
        vfs.xCurrentTime = Some(x_current_time);
        vfs.xGetLastError = Some(x_get_last_error);
        vfs.xCurrentTimeInt64 = Some(x_current_time_int64);

        // SAFETY: the boxed vfs and state live until Drop unregisters them.
        let rc = unsafe { ffi::sqlite3_vfs_register(&mut *vfs, 0) };
        if rc != ffi::SQLITE_OK {
            return Err(VfsError::Register(format!("sqlite3_vfs_register({name}) returned {rc}")));
        }
        tracing::debug!(vfs = name, cache_pages, "vfs registered");

        Ok(Self { vfs, state })
    }

    pub fn name(&self) -> &str {
        self.state.name.to_str().unwrap_or_default()
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.state.registry
    }

    /// Number of files SQLite currently holds open through this VFS.
    pub fn open_files(&self) -> usize {
        self.state.files.read().len()
    }

    /// Open `path` read-only through this VFS.
    ///
    /// The key must already be registered.
    pub fn open(&self, path: &Path) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Ok(Connection::open_with_flags_and_vfs(path, flags, self.name())?)
    }

    /// Whether a page of `path` failed authentication since the last call.
    pub fn take_auth_failure(&self, path: &Path) -> bool {
        self.state.auth_failures.lock().remove(path)
    }
}

impl Drop for ShardVfs {
    fn drop(&mut self) {
        // SAFETY: self.vfs was registered in `register` and is still alive.
        unsafe {
            ffi::sqlite3_vfs_unregister(&mut *self.vfs);
        }
        tracing::debug!(vfs = %self.state.name.to_string_lossy(), "vfs unregistered");
    }
}

/// Run an FFI callback body, mapping a panic to `on_panic`.
fn guard<F: FnOnce() -> c_int>(on_panic: c_int, f: F) -> c_int {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(on_panic)
}

/// SAFETY: `vfs` must be a ShardVfs registration whose pAppData is live.
unsafe fn state_of<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a VfsState {
    &*((*vfs).pAppData as *const VfsState)
}

/// SAFETY: `file` must have been initialised by `x_open`.
unsafe fn virtual_file<'a>(file: *mut ffi::sqlite3_file) -> Option<(&'a VfsState, Arc<VirtualFile>)> {
    let shard = &*(file as *const ShardFile);
    let state = shard.state.as_ref()?;
    let vf = state.file(shard.id)?;
    Some((state, vf))
}

/// SAFETY: `name` must be a valid NUL-terminated string.
unsafe fn path_from_c(name: *const c_char) -> PathBuf {
    let bytes = CStr::from_ptr(name).to_bytes();
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    // SQLite skips xClose when pMethods is null, which is what a failed open needs.
    (*file).pMethods = ptr::null();

    guard(ffi::SQLITE_CANTOPEN, || {
        let state = state_of(vfs);
        if name.is_null() || flags & ffi::SQLITE_OPEN_MAIN_DB == 0 {
            tracing::debug!(flags, "refusing non-database open");
            return ffi::SQLITE_CANTOPEN;
        }
        let path = path_from_c(name);
        match state.open_file(&path) {
            Ok(id) => {
                ptr::write(
                    file as *mut ShardFile,
                    ShardFile {
                        base: ffi::sqlite3_file {
                            pMethods: &state.io_methods,
                        },
                        state,
                        id,
                    },
                );
                if !out_flags.is_null() {
                    *out_flags = ffi::SQLITE_OPEN_READONLY;
                }
                ffi::SQLITE_OK
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "vfs open failed");
                ffi::SQLITE_CANTOPEN
            }
        }
    })
}

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    guard(ffi::SQLITE_IOERR_CLOSE, || {
        let shard = &*(file as *const ShardFile);
        if let Some(state) = shard.state.as_ref() {
            if let Some(vf) = state.files.write().remove(&shard.id) {
                let stats = vf.cache_stats();
                tracing::debug!(
                    id = shard.id,
                    path = %vf.path().display(),
                    hits = stats.hits,
                    misses = stats.misses,
                    "virtual file closed"
                );
            }
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_read(file: *mut ffi::sqlite3_file, buf: *mut c_void, amt: c_int, offset: ffi::sqlite3_int64) -> c_int {
    guard(ffi::SQLITE_IOERR_READ, || {
        let Some((state, vf)) = virtual_file(file) else {
            return ffi::SQLITE_IOERR_READ;
        };
        if amt < 0 || offset < 0 || buf.is_null() {
            return ffi::SQLITE_IOERR_READ;
        }
        let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
        match vf.read(out, offset as u64) {
            Ok(n) if n == out.len() => ffi::SQLITE_OK,
            Ok(_) => ffi::SQLITE_IOERR_SHORT_READ,
            Err(err) => {
                state.note_read_failure(vf.path(), &err);
                tracing::debug!(path = %vf.path().display(), offset, amt, error = %err, "vfs read failed");
                ffi::SQLITE_IOERR_READ
            }
        }
    })
}

unsafe extern "C" fn x_write(
    _file: *mut ffi::sqlite3_file,
    _buf: *const c_void,
    _amt: c_int,
    _offset: ffi::sqlite3_int64,
) -> c_int {
    ffi::SQLITE_READONLY
}

unsafe extern "C" fn x_truncate(_file: *mut ffi::sqlite3_file, _size: ffi::sqlite3_int64) -> c_int {
    ffi::SQLITE_READONLY
}

unsafe extern "C" fn x_sync(_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_size(file: *mut ffi::sqlite3_file, size: *mut ffi::sqlite3_int64) -> c_int {
    guard(ffi::SQLITE_IOERR_FSTAT, || match virtual_file(file) {
        Some((_, vf)) => {
            *size = vf.size() as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        None => ffi::SQLITE_IOERR_FSTAT,
    })
}

unsafe extern "C" fn x_lock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(_file: *mut ffi::sqlite3_file, out: *mut c_int) -> c_int {
    *out = 0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_control(_file: *mut ffi::sqlite3_file, _op: c_int, _arg: *mut c_void) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    SECTOR_SIZE
}

unsafe extern "C" fn x_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    ffi::SQLITE_IOCAP_IMMUTABLE
}

unsafe extern "C" fn x_delete(_vfs: *mut ffi::sqlite3_vfs, _name: *const c_char, _sync_dir: c_int) -> c_int {
    ffi::SQLITE_READONLY
}

unsafe extern "C" fn x_access(_vfs: *mut ffi::sqlite3_vfs, name: *const c_char, _flags: c_int, out: *mut c_int) -> c_int {
    guard(ffi::SQLITE_IOERR_ACCESS, || {
        *out = 0;
        if name.is_null() {
            return ffi::SQLITE_OK;
        }
        let path = path_from_c(name);
        let side_file = path
            .to_str()
            .is_some_and(|p| p.ends_with("-journal") || p.ends_with("-wal") || p.ends_with("-shm"));
        if !side_file && path.exists() {
            *out = 1;
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    n_out: c_int,
    out: *mut c_char,
) -> c_int {
    if name.is_null() || out.is_null() {
        return ffi::SQLITE_CANTOPEN;
    }
    let bytes = CStr::from_ptr(name).to_bytes_with_nul();
    if bytes.len() > n_out.max(0) as usize {
        return ffi::SQLITE_CANTOPEN;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
    ffi::SQLITE_OK
}

/// The process default VFS, used for randomness, sleep and time.
fn default_vfs() -> Option<*mut ffi::sqlite3_vfs> {
    // SAFETY: a null name asks SQLite for the default VFS.
    let vfs = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
    (!vfs.is_null()).then_some(vfs)
}

unsafe extern "C" fn x_randomness(_vfs: *mut ffi::sqlite3_vfs, n: c_int, out: *mut c_char) -> c_int {
    match default_vfs().and_then(|d| (*d).xRandomness.map(|f| (d, f))) {
        Some((d, f)) => f(d, n, out),
        None => 0,
    }
}

unsafe extern "C" fn x_sleep(_vfs: *mut ffi::sqlite3_vfs, micros: c_int) -> c_int {
    match default_vfs().and_then(|d| (*d).xSleep.map(|f| (d, f))) {
        Some((d, f)) => f(d, micros),
        None => micros,
    }
}

unsafe extern "C" fn x_current_time(_vfs: *mut ffi::sqlite3_vfs, out: *mut f64) -> c_int {
    match default_vfs().and_then(|d| (*d).xCurrentTime.map(|f| (d, f))) {
        Some((d, f)) => f(d, out),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn x_current_time_int64(_vfs: *mut ffi::sqlite3_vfs, out: *mut ffi::sqlite3_int64) -> c_int {
    match default_vfs().and_then(|d| (*d).xCurrentTimeInt64.map(|f| (d, f))) {
        Some((d, f)) => f(d, out),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn x_get_last_error(_vfs: *mut ffi::sqlite3_vfs, n: c_int, out: *mut c_char) -> c_int {
    if n > 0 && !out.is_null() {
        *out = 0;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KeyParameters;
    use rand::RngCore;
    use shardlog_crypto::{derive_keys, encrypt_page, CipherProfile};

    const PROFILE: CipherProfile = CipherProfile::MacosV3;
    const KEY: [u8; 32] = [0x5c; 32];

    /// Build a plaintext database with the profile's page size and reserve,
    /// then encrypt every page into `dir/message_0.db`.
    fn encrypted_db(dir: &Path) -> PathBuf {
        let plain_path = dir.join("plain.db");
        {
            let conn = Connection::open(&plain_path).expect("open plain");
            let reserve = PROFILE.reserve() as c_int;
            // SAFETY: handle is a live connection; reserve bytes must be set before the first write.
            let rc = unsafe {
                let mut n = reserve;
                ffi::sqlite3_file_control(
                    conn.handle(),
                    b"main\0".as_ptr() as *const c_char,
                    ffi::SQLITE_FCNTL_RESERVE_BYTES,
                    &mut n as *mut c_int as *mut c_void,
                )
            };
            assert_eq!(rc, ffi::SQLITE_OK);
            conn.execute_batch(&format!(
                "PRAGMA page_size = {};
                 PRAGMA journal_mode = DELETE;
                 CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT);",
                PROFILE.page_size()
            ))
            .expect("schema");
            let mut stmt = conn.prepare("INSERT INTO t (body) VALUES (?1)").expect("prepare");
            for i in 0..200 {
                stmt.execute([format!("row number {i} with some padding text")]).expect("insert");
            }
        }

        let plain = std::fs::read(&plain_path).expect("read plain");
        let ps = PROFILE.page_size();
        assert_eq!(plain.len() % ps, 0);
        assert_eq!(plain[20] as usize, PROFILE.reserve());

        let mut rng = rand::thread_rng();
        let mut salt = [0u8; 16];
        rng.fill_bytes(&mut salt);
        let keys = derive_keys(&KEY, &salt, PROFILE);
        let mut out = Vec::with_capacity(plain.len());
        for (index, page) in plain.chunks(ps).enumerate() {
            let mut iv = [0u8; 16];
            rng.fill_bytes(&mut iv);
            out.extend(encrypt_page(page, index as u64, &keys, PROFILE, &salt, &iv).expect("encrypt"));
        }
        let path = dir.join("message_0.db");
        std::fs::write(&path, out).expect("write encrypted");
        path
    }

    #[test]
    fn test_query_through_vfs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = encrypted_db(dir.path());
        let registry = Arc::new(KeyRegistry::new());
        registry.register(&path, KeyParameters::new(KEY, PROFILE));
        let vfs = ShardVfs::register("shardlog-test-query", Arc::clone(&registry), 16).expect("register");

        let conn = vfs.open(&path).expect("open");
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).expect("count");
        assert_eq!(count, 200);
        let body: String = conn
            .query_row("SELECT body FROM t WHERE id = 150", [], |r| r.get(0))
            .expect("row");
        assert_eq!(body, "row number 149 with some padding text");
        assert_eq!(vfs.open_files(), 1);

        drop(conn);
        assert_eq!(vfs.open_files(), 0);
    }

    #[test]
    fn test_writes_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = encrypted_db(dir.path());
        let registry = Arc::new(KeyRegistry::new());
        registry.register(&path, KeyParameters::new(KEY, PROFILE));
        let vfs = ShardVfs::register("shardlog-test-write", registry, 16).expect("register");

        let conn = vfs.open(&path).expect("open");
        assert!(conn.execute("INSERT INTO t (body) VALUES ('x')", []).is_err());
    }

    #[test]
    fn test_missing_key_cannot_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = encrypted_db(dir.path());
        let vfs = ShardVfs::register("shardlog-test-nokey", Arc::new(KeyRegistry::new()), 16).expect("register");
        let opened = vfs
            .open(&path)
            .and_then(|conn| Ok(conn.query_row("SELECT count(*) FROM t", [], |r| r.get::<_, i64>(0))?));
        assert!(opened.is_err());
    }

    #[test]
    fn test_wrong_key_records_auth_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = encrypted_db(dir.path());
        let registry = Arc::new(KeyRegistry::new());
        registry.register(&path, KeyParameters::new([0x5d; 32], PROFILE));
        let vfs = ShardVfs::register("shardlog-test-wrongkey", registry, 16).expect("register");

        // The header read at open time may already fail.
        let failed = match vfs.open(&path) {
            Err(_) => true,
            Ok(conn) => conn.query_row("SELECT count(*) FROM t", [], |r| r.get::<_, i64>(0)).is_err(),
        };
        assert!(failed);
        assert!(vfs.take_auth_failure(&path));
        assert!(!vfs.take_auth_failure(&path));
    }

    #[test]
    fn test_duplicate_connections_have_independent_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = encrypted_db(dir.path());
        let registry = Arc::new(KeyRegistry::new());
        registry.register(&path, KeyParameters::new(KEY, PROFILE));
        let vfs = ShardVfs::register("shardlog-test-dup", registry, 16).expect("register");

        let a = vfs.open(&path).expect("open a");
        let b = vfs.open(&path).expect("open b");
        let count_a: i64 = a.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).expect("a");
        let count_b: i64 = b.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).expect("b");
        assert_eq!(count_a, count_b);
        assert_eq!(vfs.open_files(), 2);
    }
}
