//! Chat wire protocol: destinations and their payloads.
//!
//! DESIGN
//! ======
//! Each destination carries exactly one payload type. Frames are parsed into
//! that type at the subscription boundary with [`decode_payload`]; a body
//! that does not match is a [`PayloadError`], which callers log and drop.

mod destination;
mod timestamp;
mod types;

pub use destination::{Destination, UnknownDestination};
pub use timestamp::Timestamp;
pub use types::{
    Attachment, Conversation, HistoryReply, JoinRequest, Message, MessageContent, MessageKind, PresenceEvent,
    ReadReceipt, ReadRequest, SendRequest, TypingEvent, TypingRequest, UserQueueEvent,
};

use serde::de::DeserializeOwned;

/// A frame body that does not match its destination's schema.
#[derive(Debug, thiserror::Error)]
#[error("malformed payload on {destination}: {source}")]
pub struct PayloadError {
    pub destination: String,
    #[source]
    pub source: serde_json::Error,
}

/// Parse a frame body as the payload type expected on `destination`.
pub fn decode_payload<T: DeserializeOwned>(destination: &str, body: &str) -> Result<T, PayloadError> {
    serde_json::from_str(body).map_err(|source| PayloadError { destination: destination.to_owned(), source })
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
