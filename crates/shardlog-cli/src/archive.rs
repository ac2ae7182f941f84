//! Opening an archive from configuration.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use shardlog_catalog::catalog::is_shard_file_name;
use shardlog_catalog::{ShardCatalog, ShardPool};
use shardlog_crypto::kdf::parse_hex_key;
use shardlog_crypto::{validate_key, CipherProfile};
use shardlog_vfs::{CopyAccess, KeyParameters, ShardAccess, VfsAccess};

use crate::config::{AccessMode, ShardlogConfig};

/// Access strategy selected by `[archive]`.
///
/// VFS access without a key falls back to plaintext copies.
pub fn access_strategy(config: &ShardlogConfig) -> anyhow::Result<Arc<dyn ShardAccess>> {
    let archive = &config.archive;
    match archive.access {
        AccessMode::Copy => Ok(Arc::new(CopyAccess::temp()?)),
        AccessMode::Vfs if archive.key.trim().is_empty() => {
            tracing::warn!("no key configured, opening shards as plaintext copies");
            Ok(Arc::new(CopyAccess::temp()?))
        }
        AccessMode::Vfs => {
            let key = KeyParameters::from_hex(archive.key.trim(), archive.platform, archive.version)
                .context("invalid archive key")?;
            tracing::info!(profile = %key.profile().name(), "using in-place decryption");
            let mut access = VfsAccess::new(key, config.cache.pages)?;
            if archive.copy_fallback {
                access = access.with_fallback(Box::new(CopyAccess::temp()?));
            }
            Ok(Arc::new(access))
        }
    }
}

/// Discover the configured archive's shards.
pub fn open_catalog(config: &ShardlogConfig) -> anyhow::Result<Arc<ShardCatalog>> {
    let pool = ShardPool::with_grace(access_strategy(config)?, config.release_grace());
    let catalog = ShardCatalog::with_pool(config.data_dir(), config.shard_dir(), pool)
        .with_context(|| format!("cannot open shards in {}", config.shard_dir().display()))?;
    Ok(Arc::new(catalog))
}

/// First shard file in `dir`, by name.
pub fn first_shard(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.file_name().and_then(|n| n.to_str()).is_some_and(is_shard_file_name))
        .collect();
    shards.sort();
    shards
        .into_iter()
        .next()
        .with_context(|| format!("no shard files in {}", dir.display()))
}

/// Check `hex_key` against the first page of `shard`.
pub fn check_key(shard: &Path, hex_key: &str, profile: CipherProfile) -> anyhow::Result<bool> {
    let key = parse_hex_key(hex_key.trim())?;
    let mut first_page = vec![0u8; profile.page_size()];
    std::fs::File::open(shard)
        .and_then(|mut file| file.read_exact(&mut first_page))
        .with_context(|| format!("cannot read first page of {}", shard.display()))?;
    Ok(validate_key(&first_page, &key, profile))
}
