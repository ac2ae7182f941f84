//! Decoding stored message rows.

use shardlog_types::message::CHATROOM_SUFFIX;
use shardlog_types::{ConversationHash, Message, MessageKind};

use crate::queries::RawMessageRow;

/// Frame magic of zstd-compressed `message_content`.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// `status` value of messages sent by the archive owner.
pub const STATUS_SENT: i64 = 2;

/// Decode a stored row for conversation `talker`.
pub fn decode_row(row: RawMessageRow, talker: &str, talker_hash: ConversationHash) -> Message {
    let is_chatroom = talker.ends_with(CHATROOM_SUFFIX);
    let is_self = row.status == STATUS_SENT;
    let mut sender = row.sender.unwrap_or_default();
    let mut content = decode_content(&row.content);

    if is_chatroom {
        if let Some((prefix, rest)) = split_sender_prefix(&content) {
            if sender.is_empty() {
                sender = prefix.to_string();
            }
            content = rest.to_string();
        }
    }

    Message {
        seq: row.sort_seq,
        server_id: row.server_id,
        time: row.create_time,
        talker: talker.to_string(),
        talker_hash,
        sender,
        is_self,
        is_chatroom,
        kind: MessageKind::from_local_type(row.local_type),
        sub_type: (row.local_type >> 32) as u32,
        content,
    }
}

/// Text of `message_content`, decompressing zstd frames.
///
/// Content that fails to decompress is returned lossily as stored.
pub fn decode_content(raw: &[u8]) -> String {
    if raw.starts_with(&ZSTD_MAGIC) {
        match zstd::decode_all(raw) {
            Ok(plain) => return String::from_utf8_lossy(&plain).into_owned(),
            Err(err) => tracing::debug!(error = %err, len = raw.len(), "zstd content did not decode"),
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Split a chat-room `"<sender>:\n<body>"` prefix.
fn split_sender_prefix(content: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = content.split_once(":\n")?;
    let looks_like_id = !prefix.is_empty() && !prefix.chars().any(char::is_whitespace);
    looks_like_id.then_some((prefix, rest))
}
