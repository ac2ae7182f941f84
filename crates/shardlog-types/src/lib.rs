//! # shardlog-types
//!
//! Shared domain types used across the shardlog workspace: platforms,
//! conversation hashes, decoded messages, shard snapshots and query
//! descriptions.

pub mod conversation;
pub mod message;
pub mod platform;
pub mod query;
pub mod shard;

pub use conversation::ConversationHash;
pub use message::{Message, MessageKind};
pub use platform::Platform;
pub use query::{GlobalStats, Heatmap, MessageQuery, MonthlyTrend};
pub use shard::ShardInfo;

/// Unix epoch seconds, as stored in `create_time` and `Timestamp` columns.
pub type UnixSeconds = i64;

/// Margin added to "now" for the end time of the newest (still growing) shard.
pub const NEWEST_SHARD_MARGIN_SECS: i64 = 3600;

/// Current wall-clock time in Unix seconds.
pub fn now_unix() -> UnixSeconds {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
