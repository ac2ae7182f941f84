//! Configuration file management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardlog_types::Platform;

/// Environment variable naming the shardlog data directory.
pub const DATA_DIR_ENV: &str = "SHARDLOG_DATA_DIR";

/// Complete CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardlogConfig {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// How shard files are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Decrypt in place through the VFS.
    #[default]
    Vfs,
    /// Open plaintext copies.
    Copy,
}

/// Archive location and key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive root. Empty = current directory.
    #[serde(default)]
    pub data_dir: String,
    /// Shard directory, relative to `data_dir` unless absolute.
    #[serde(default = "default_shard_dir")]
    pub shard_dir: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default = "default_version")]
    pub version: u32,
    /// 64 hex digits. Empty = none; only copy access works.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub access: AccessMode,
    /// With `access = "vfs"`, retry failed opens through plaintext copies.
    #[serde(default)]
    pub copy_fallback: bool,
}

/// Page cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Decrypted pages kept per open shard handle.
    #[serde(default = "default_cache_pages")]
    pub pages: usize,
}

/// Query defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Limit used when `--limit` is not given. 0 = unlimited.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between evicting a replaced shard and dropping its key.
    #[serde(default = "default_release_grace")]
    pub release_grace_secs: u64,
}

// Default value functions

fn default_shard_dir() -> String {
    "db_storage/message".to_string()
}

fn default_version() -> u32 {
    4
}

fn default_cache_pages() -> usize {
    shardlog_vfs::DEFAULT_CACHE_PAGES
}

fn default_limit() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_release_grace() -> u64 {
    shardlog_catalog::DEFAULT_RELEASE_GRACE.as_secs()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            shard_dir: default_shard_dir(),
            platform: Platform::default(),
            version: default_version(),
            key: String::new(),
            access: AccessMode::default(),
            copy_fallback: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pages: default_cache_pages(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            release_grace_secs: default_release_grace(),
        }
    }
}

impl ShardlogConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: ShardlogConfig = toml::from_str(&content)?;
            tracing::debug!(path = %config_path.display(), "configuration loaded");
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Archive root directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.archive.data_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.archive.data_dir)
        }
    }

    /// Directory holding the `message_<n>.db` shards.
    pub fn shard_dir(&self) -> PathBuf {
        // `join` keeps an absolute shard_dir as is.
        self.data_dir().join(&self.archive.shard_dir)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.advanced.release_grace_secs)
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Platform-specific default config directory.
    fn default_config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/shardlog")
        }
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA")
                .map(|d| PathBuf::from(d).join("shardlog"))
                .unwrap_or_else(|_| dirs_fallback("shardlog"))
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".shardlog")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from(".shardlog"))
}
