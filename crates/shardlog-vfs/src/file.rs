//! Decrypting view over one encrypted shard file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shardlog_crypto::kdf::SALT_SIZE;
use shardlog_crypto::{decrypt_page, derive_keys, CipherProfile, PageKeys};

use crate::cache::{CacheStats, PageCache};
use crate::registry::KeyParameters;
use crate::{Result, VfsError};

/// An open, read-only shard whose reads return plaintext.
///
/// The logical size equals the raw file size; the page layout is preserved
/// one to one.
pub struct VirtualFile {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    profile: CipherProfile,
    keys: PageKeys,
    cache: PageCache,
}

impl VirtualFile {
    /// Open `path` and derive its page keys from the embedded salt.
    pub fn open(id: u64, path: &Path, params: &KeyParameters, cache_pages: usize) -> Result<Self> {
        let cannot_open = |source: io::Error| VfsError::CannotOpen {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(cannot_open)?;
        let size = file.metadata().map_err(cannot_open)?.len();

        let mut salt = [0u8; SALT_SIZE];
        if read_full_at(&file, &mut salt, 0).map_err(cannot_open)? < SALT_SIZE {
            return Err(cannot_open(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than its salt",
            )));
        }

        let profile = params.profile();
        let keys = derive_keys(params.raw_key(), &salt, profile);
        tracing::debug!(id, path = %path.display(), size, profile = %profile.name(), "virtual file opened");

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            size,
            profile,
            keys,
            cache: PageCache::new(cache_pages),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn profile(&self) -> CipherProfile {
        self.profile
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Read plaintext at `offset` into `buf`.
    ///
    /// Returns the number of bytes filled; everything past that is zeroed.
    /// A read starting at or past the end returns 0. A page failure after
    /// some bytes were filled ends the read early; a failure on the first
    /// page is returned.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let page_size = self.profile.page_size() as u64;
        let mut filled = 0usize;

        while filled < buf.len() {
            let pos = offset + filled as u64;
            if pos >= self.size {
                break;
            }
            let index = pos / page_size;
            let in_page = (pos % page_size) as usize;

            let page = match self.page(index) {
                Ok(page) => page,
                Err(err) if filled > 0 => {
                    tracing::debug!(path = %self.path.display(), page = index, error = %err, "read stopped early");
                    break;
                }
                Err(err) => return Err(err),
            };

            let n = (page.len() - in_page)
                .min(buf.len() - filled)
                .min((self.size - pos) as usize);
            buf[filled..filled + n].copy_from_slice(&page[in_page..in_page + n]);
            filled += n;
        }

        buf[filled..].fill(0);
        Ok(filled)
    }

    /// Decrypted page `index`, from cache when possible.
    pub fn page(&self, index: u64) -> Result<Arc<[u8]>> {
        self.cache.get(index, || {
            let raw = self.read_raw_page(index)?;
            decrypt_page(&raw, index, &self.keys, self.profile).map_err(|err| {
                tracing::warn!(path = %self.path.display(), page = index, error = %err, "page rejected");
                VfsError::from(err)
            })
        })
    }

    /// Raw page bytes; a truncated final page is zero-filled.
    fn read_raw_page(&self, index: u64) -> Result<Vec<u8>> {
        let page_size = self.profile.page_size();
        let mut raw = vec![0u8; page_size];
        let n = read_full_at(&self.file, &mut raw, index * page_size as u64)?;
        if n == 0 {
            return Err(VfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("page {index} is past the end of the file"),
            )));
        }
        Ok(raw)
    }
}

/// Positional read that keeps going until `buf` is full or EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}
