//! Conversation hashes.
//!
//! A conversation is stored in each shard as a table named `Msg_<hex>`,
//! where `<hex>` is the 128-bit digest of the conversation identifier.
//! The digest is computed by `shardlog_crypto::hash::conversation_hash`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix of every per-conversation message table.
pub const TABLE_PREFIX: &str = "Msg_";

/// 128-bit conversation digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationHash(pub [u8; 16]);

impl ConversationHash {
    /// Lowercase hex rendering, as used in table names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Name of the message table holding this conversation.
    pub fn table_name(&self) -> String {
        format!("{TABLE_PREFIX}{}", self.to_hex())
    }

    /// Recover the hash from a `Msg_<hex>` table name.
    pub fn from_table_name(name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(TABLE_PREFIX)?;
        if suffix.len() != 32 {
            return None;
        }
        Self::from_hex(&suffix.to_ascii_lowercase())
    }
}

impl fmt::Debug for ConversationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationHash({})", self.to_hex())
    }
}

impl fmt::Display for ConversationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ConversationHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ConversationHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid conversation hash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_roundtrip() {
        let hash = ConversationHash([0xab; 16]);
        let table = hash.table_name();
        assert_eq!(table, "Msg_abababababababababababababababab");
        assert_eq!(ConversationHash::from_table_name(&table), Some(hash));
    }

    #[test]
    fn test_rejects_foreign_tables() {
        assert_eq!(ConversationHash::from_table_name("Name2Id"), None);
        assert_eq!(ConversationHash::from_table_name("Msg_"), None);
        assert_eq!(ConversationHash::from_table_name("Msg_zz"), None);
    }

    #[test]
    fn test_serde_as_hex() {
        let hash = ConversationHash([1; 16]);
        let json = serde_json::to_string(&hash).expect("serialize");
        assert_eq!(json, "\"01010101010101010101010101010101\"");
        let back: ConversationHash = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, hash);
    }
}
