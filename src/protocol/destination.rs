//! Broker destinations.
//!
//! Every address the client publishes to or subscribes on is one variant of
//! [`Destination`]. `Display` renders the wire string and `FromStr` parses it
//! back, so raw strings only appear at the transport boundary.

use std::fmt;
use std::str::FromStr;

const APP_JOIN: &str = "/app/chat.join";
const APP_SEND: &str = "/app/chat.send";
const APP_TYPING: &str = "/app/chat.typing";
const APP_READ: &str = "/app/chat.read";
const USER_HISTORY: &str = "/user/queue/conversation-history";
const USER_PRESENCE: &str = "/user/queue/presence";
const TOPIC_CONVERSATION: &str = "/topic/conversation/";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// `/app/chat.join`: enroll in a conversation's fan-out and request history.
    Join,
    /// `/app/chat.send`
    Send,
    /// `/app/chat.typing`
    Typing,
    /// `/app/chat.read`
    Read,
    /// `/user/queue/conversation-history`: history replies for this user.
    ConversationHistory,
    /// `/user/queue/presence`
    Presence,
    /// `/topic/conversation/{id}`: live messages.
    ConversationMessages(String),
    /// `/topic/conversation/{id}/typing`
    ConversationTyping(String),
    /// `/topic/conversation/{id}/read`
    ConversationRead(String),
}

impl Destination {
    /// True for `/app/...` destinations, which are publish-only.
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Join | Self::Send | Self::Typing | Self::Read)
    }

    /// Conversation the destination is scoped to, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::ConversationMessages(id) | Self::ConversationTyping(id) | Self::ConversationRead(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => f.write_str(APP_JOIN),
            Self::Send => f.write_str(APP_SEND),
            Self::Typing => f.write_str(APP_TYPING),
            Self::Read => f.write_str(APP_READ),
            Self::ConversationHistory => f.write_str(USER_HISTORY),
            Self::Presence => f.write_str(USER_PRESENCE),
            Self::ConversationMessages(id) => write!(f, "{TOPIC_CONVERSATION}{id}"),
            Self::ConversationTyping(id) => write!(f, "{TOPIC_CONVERSATION}{id}/typing"),
            Self::ConversationRead(id) => write!(f, "{TOPIC_CONVERSATION}{id}/read"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown destination: {0}")]
pub struct UnknownDestination(pub String);

impl FromStr for Destination {
    type Err = UnknownDestination;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fixed = match s {
            APP_JOIN => Some(Self::Join),
            APP_SEND => Some(Self::Send),
            APP_TYPING => Some(Self::Typing),
            APP_READ => Some(Self::Read),
            USER_HISTORY => Some(Self::ConversationHistory),
            USER_PRESENCE => Some(Self::Presence),
            _ => None,
        };
        if let Some(dest) = fixed {
            return Ok(dest);
        }

        let unknown = || UnknownDestination(s.to_owned());
        let rest = s.strip_prefix(TOPIC_CONVERSATION).ok_or_else(unknown)?;
        let (id, suffix) = match rest.split_once('/') {
            Some((id, suffix)) => (id, Some(suffix)),
            None => (rest, None),
        };
        if id.is_empty() {
            return Err(unknown());
        }
        match suffix {
            None => Ok(Self::ConversationMessages(id.to_owned())),
            Some("typing") => Ok(Self::ConversationTyping(id.to_owned())),
            Some("read") => Ok(Self::ConversationRead(id.to_owned())),
            Some(_) => Err(unknown()),
        }
    }
}

#[cfg(test)]
#[path = "destination_test.rs"]
mod tests;
