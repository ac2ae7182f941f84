//! Shard snapshots exposed to callers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::UnixSeconds;

/// Point-in-time description of one shard file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// File stem, e.g. `message_3`.
    pub id: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub index_path: PathBuf,
    pub start_time: UnixSeconds,
    /// Start of the next shard, or now + 1 hour for the newest shard.
    pub end_time: UnixSeconds,
    pub conversation_count: usize,
}

impl ShardInfo {
    /// Whether this shard's range intersects `[start, end]`.
    pub fn overlaps(&self, start: UnixSeconds, end: UnixSeconds) -> bool {
        !(self.end_time < start || self.start_time > end)
    }
}
