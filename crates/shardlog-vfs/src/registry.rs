//! Key registry.
//!
//! SQLite hands the VFS nothing but a path when it opens a file, so the key
//! parameters for every shard must be registered here first.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use shardlog_crypto::kdf::parse_hex_key;
use shardlog_crypto::{CipherProfile, KEY_SIZE};
use shardlog_types::Platform;
use zeroize::Zeroizing;

use crate::{Result, VfsError};

/// Raw key plus the cipher profile of the files it opens.
#[derive(Clone)]
pub struct KeyParameters {
    raw_key: Zeroizing<[u8; KEY_SIZE]>,
    profile: CipherProfile,
}

impl KeyParameters {
    pub fn new(raw_key: [u8; KEY_SIZE], profile: CipherProfile) -> Self {
        Self {
            raw_key: Zeroizing::new(raw_key),
            profile,
        }
    }

    /// Parse a 64-character hex key for the given platform and version.
    pub fn from_hex(hex_key: &str, platform: Platform, version: u32) -> Result<Self> {
        Ok(Self {
            raw_key: parse_hex_key(hex_key)?,
            profile: CipherProfile::resolve(platform, version),
        })
    }

    pub fn raw_key(&self) -> &[u8; KEY_SIZE] {
        &self.raw_key
    }

    pub fn profile(&self) -> CipherProfile {
        self.profile
    }
}

impl fmt::Debug for KeyParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyParameters")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Path-scoped key table, one per archive root.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    entries: RwLock<HashMap<PathBuf, Arc<KeyParameters>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) the parameters for `path`.
    pub fn register(&self, path: impl Into<PathBuf>, params: KeyParameters) {
        self.register_shared(path, Arc::new(params));
    }

    pub fn register_shared(&self, path: impl Into<PathBuf>, params: Arc<KeyParameters>) {
        let path = path.into();
        tracing::debug!(path = %path.display(), profile = ?params.profile(), "key registered");
        self.entries.write().insert(path, params);
    }

    /// Remove the entry for `path`. Returns whether one existed.
    pub fn unregister(&self, path: &Path) -> bool {
        let removed = self.entries.write().remove(path).is_some();
        if removed {
            tracing::debug!(path = %path.display(), "key unregistered");
        }
        removed
    }

    pub fn lookup(&self, path: &Path) -> Result<Arc<KeyParameters>> {
        self.entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::NoKey(path.to_path_buf()))
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.read().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
