//! Decoded chat messages.

use serde::{Deserialize, Serialize};

use crate::{ConversationHash, UnixSeconds};

/// Suffix that marks a group conversation identifier.
pub const CHATROOM_SUFFIX: &str = "@chatroom";

/// Message category, taken from the low 32 bits of `local_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    ContactCard,
    Video,
    Emoji,
    Location,
    App,
    VoipCall,
    System,
    Other(u32),
}

impl MessageKind {
    pub fn from_local_type(local_type: i64) -> Self {
        match (local_type & 0xFFFF_FFFF) as u32 {
            1 => MessageKind::Text,
            3 => MessageKind::Image,
            34 => MessageKind::Voice,
            42 => MessageKind::ContactCard,
            43 => MessageKind::Video,
            47 => MessageKind::Emoji,
            48 => MessageKind::Location,
            49 => MessageKind::App,
            50 => MessageKind::VoipCall,
            10000 => MessageKind::System,
            other => MessageKind::Other(other),
        }
    }

    /// Stable lowercase name used in statistics.
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
            MessageKind::ContactCard => "contact_card",
            MessageKind::Video => "video",
            MessageKind::Emoji => "emoji",
            MessageKind::Location => "location",
            MessageKind::App => "app",
            MessageKind::VoipCall => "voip_call",
            MessageKind::System => "system",
            MessageKind::Other(_) => "other",
        }
    }

    /// Placeholder shown for kinds without a textual body.
    pub fn placeholder(&self) -> &'static str {
        match self {
            MessageKind::Text | MessageKind::System => "",
            MessageKind::Image => "[image]",
            MessageKind::Voice => "[voice]",
            MessageKind::ContactCard => "[contact card]",
            MessageKind::Video => "[video]",
            MessageKind::Emoji => "[emoji]",
            MessageKind::Location => "[location]",
            MessageKind::App => "[link]",
            MessageKind::VoipCall => "[call]",
            MessageKind::Other(_) => "[message]",
        }
    }
}

/// A message row decoded from a shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// `sort_seq`; the only ordering key within a conversation.
    pub seq: i64,
    pub server_id: i64,
    pub time: UnixSeconds,
    pub talker: String,
    pub talker_hash: ConversationHash,
    pub sender: String,
    /// `status == 2`.
    pub is_self: bool,
    pub is_chatroom: bool,
    pub kind: MessageKind,
    /// High 32 bits of `local_type` (app message sub type).
    pub sub_type: u32,
    /// Decompressed `message_content`, with any chat-room sender prefix removed.
    pub content: String,
}

impl Message {
    /// Human-readable rendering used for keyword matching and display.
    pub fn plain_text(&self) -> String {
        match self.kind {
            MessageKind::Text | MessageKind::System => self.content.clone(),
            MessageKind::App => match xml_element(&self.content, "title") {
                Some(title) if !title.is_empty() => format!("[link] {title}"),
                _ => self.kind.placeholder().to_string(),
            },
            kind => kind.placeholder().to_string(),
        }
    }
}

/// Text between the first `<tag>` and the following `</tag>`.
fn xml_element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(xml[start..start + len].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: MessageKind, content: &str) -> Message {
        Message {
            seq: 1,
            server_id: 0,
            time: 0,
            talker: "alice".into(),
            talker_hash: ConversationHash([0; 16]),
            sender: "alice".into(),
            is_self: false,
            is_chatroom: false,
            kind,
            sub_type: 0,
            content: content.into(),
        }
    }

    #[test]
    fn test_kind_uses_low_bits() {
        let local_type = (5_i64 << 32) | 49;
        assert_eq!(MessageKind::from_local_type(local_type), MessageKind::App);
        assert_eq!(MessageKind::from_local_type(1), MessageKind::Text);
        assert_eq!(MessageKind::from_local_type(9999), MessageKind::Other(9999));
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(message(MessageKind::Text, "hi").plain_text(), "hi");
        assert_eq!(message(MessageKind::Image, "<img/>").plain_text(), "[image]");
        let app = message(MessageKind::App, "<msg><appmsg><title> Rust 1.80 </title></appmsg></msg>");
        assert_eq!(app.plain_text(), "[link] Rust 1.80");
        assert_eq!(message(MessageKind::App, "<msg/>").plain_text(), "[link]");
    }
}
