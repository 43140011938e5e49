//! Wire payloads, one type per destination.
//!
//! Field names follow the broker's camelCase JSON. Inbound types are lenient
//! about optional fields and strict about the ones the store keys on (`id`,
//! `conversationId`, `createdAt`).

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Timestamp;

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    #[serde(alias = "TEXT")]
    Text,
    #[serde(alias = "FILE")]
    File,
    #[serde(alias = "IMAGE")]
    Image,
    #[serde(alias = "VIDEO")]
    Video,
    #[serde(alias = "audio", alias = "VOICE_AUDIO")]
    VoiceAudio,
    #[serde(alias = "MUSIC_AUDIO")]
    MusicAudio,
}

impl MessageKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::Image => "image",
            Self::Video => "video",
            Self::VoiceAudio => "voice",
            Self::MusicAudio => "music",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Uploaded media referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: MessageKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Body of a message: plain text or a structured attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Attachment(Attachment),
    Text(String),
}

impl MessageContent {
    /// One-line rendering for the conversation list.
    #[must_use]
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Attachment(att) => {
                let name = att.file_name.as_deref().unwrap_or(&att.url);
                format!("[{}] {name}", att.kind)
            }
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Attachment> for MessageContent {
    fn from(att: Attachment) -> Self {
        Self::Attachment(att)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned; the sole de-duplication key within a conversation.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(rename = "senderUsername", alias = "senderDisplayName", default)]
    pub sender_name: String,
    #[serde(rename = "senderProfilePicture", alias = "senderAvatar", default)]
    pub sender_avatar: Option<String>,
    pub content: MessageContent,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub created_at: Timestamp,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Conversation-list preview. Media sent as a bare URL string renders as
    /// its kind label rather than the URL.
    #[must_use]
    pub fn preview(&self) -> String {
        match &self.content {
            MessageContent::Text(_) if self.kind != MessageKind::Text => format!("[{}]", self.kind),
            content => content.preview(),
        }
    }
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    /// Presence events match on this name.
    #[serde(rename = "participantUsername", alias = "counterpartName", default)]
    pub counterpart_name: String,
    #[serde(rename = "participantProfilePicture", alias = "counterpartAvatar", default)]
    pub counterpart_avatar: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<Timestamp>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_online: bool,
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// Frames on `/user/queue/conversation-history`, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum UserQueueEvent {
    #[serde(rename = "HISTORY")]
    History(HistoryReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReply {
    pub conversation_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Frames on `/user/queue/presence`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresenceEvent {
    pub username: String,
    pub online: bool,
}

/// Frames on `/topic/conversation/{id}/typing`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TypingEvent {
    #[serde(rename = "userName", alias = "username")]
    pub user_name: String,
    pub typing: bool,
}

/// Frames on `/topic/conversation/{id}/read`. The broker's shape is loose, so
/// every field is optional and unknown fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "userName", alias = "username")]
    pub reader: Option<String>,
    #[serde(default)]
    pub read_at: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// OUTBOUND REQUESTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest<'a> {
    pub conversation_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest<'a> {
    pub conversation_id: &'a str,
    pub content: &'a MessageContent,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest<'a> {
    pub conversation_id: &'a str,
    pub typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest<'a> {
    pub conversation_id: &'a str,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
