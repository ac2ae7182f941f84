//! Conversation identifier digests.

use md5::{Digest, Md5};
use shardlog_types::ConversationHash;

/// MD5 of the conversation identifier; its hex form names the `Msg_` table.
pub fn conversation_hash(talker: &str) -> ConversationHash {
    ConversationHash(Md5::digest(talker.as_bytes()).into())
}
