//! Shared fixtures: an in-memory transport and payload builders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::protocol::{Conversation, Message, MessageContent, MessageKind, Timestamp};
use crate::transport::{FrameHandler, LinkState, RawSubscription, Transport, TransportError};

// =============================================================================
// MOCK TRANSPORT
// =============================================================================

#[derive(Default)]
struct MockState {
    next_id: u64,
    live: HashMap<String, (String, FrameHandler)>,
    released: Vec<(String, FrameHandler)>,
    subscribe_calls: usize,
    published: Vec<(String, serde_json::Value)>,
    activations: Vec<String>,
    deactivations: usize,
    handshake_error: Option<String>,
    retrying: bool,
}

/// Records everything the session does and lets tests inject frames.
pub struct MockTransport {
    state: Mutex<MockState>,
    link: watch::Sender<LinkState>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (link, _) = watch::channel(LinkState::Down);
        Arc::new(Self { state: Mutex::new(MockState::default()), link })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `activate` fail as if the broker sent an ERROR frame.
    pub fn fail_handshake(&self, message: &str) {
        self.state().handshake_error = Some(message.to_owned());
    }

    /// Make `activate` succeed without raising the link, as a transport
    /// already retrying after a drop does.
    pub fn keep_retrying(&self) {
        self.state().retrying = true;
    }

    /// Deliver `body` to every live subscription on `destination`. Returns
    /// how many handlers were invoked.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let handlers: Vec<FrameHandler> = self
            .state()
            .live
            .values()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(body);
        }
        handlers.len()
    }

    pub fn deliver_json(&self, destination: &str, value: &serde_json::Value) -> usize {
        self.deliver(destination, &value.to_string())
    }

    /// Deliver to handlers that were already released, as a frame still in
    /// flight when the subscription was torn down would be.
    pub fn deliver_stale(&self, destination: &str, body: &str) -> usize {
        let handlers: Vec<FrameHandler> = self
            .state()
            .released
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(body);
        }
        handlers.len()
    }

    /// Live transport-level subscriptions on `destination`.
    #[must_use]
    pub fn live_subscriptions(&self, destination: &str) -> usize {
        self.state().live.values().filter(|(dest, _)| dest == destination).count()
    }

    #[must_use]
    pub fn live_total(&self) -> usize {
        self.state().live.len()
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    #[must_use]
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.state().published.clone()
    }

    pub fn clear_published(&self) {
        self.state().published.clear();
    }

    #[must_use]
    pub fn activations(&self) -> Vec<String> {
        self.state().activations.clone()
    }

    #[must_use]
    pub fn deactivations(&self) -> usize {
        self.state().deactivations
    }

    /// Simulate the link dropping and coming back.
    pub fn set_link(&self, state: LinkState) {
        self.link.send_replace(state);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn activate(&self, credential: &str) -> Result<(), TransportError> {
        let (failure, retrying) = {
            let mut state = self.state();
            state.activations.push(credential.to_owned());
            (state.handshake_error.take(), state.retrying)
        };
        if let Some(message) = failure {
            return Err(TransportError::Handshake { message });
        }
        if !retrying {
            self.link.send_replace(LinkState::Up);
        }
        Ok(())
    }

    async fn deactivate(&self) {
        let mut state = self.state();
        state.deactivations += 1;
        let live: Vec<(String, FrameHandler)> = state.live.drain().map(|(_, entry)| entry).collect();
        state.released.extend(live);
        drop(state);
        self.link.send_replace(LinkState::Down);
    }

    fn publish(&self, destination: &str, body: &serde_json::Value) -> Result<(), TransportError> {
        if *self.link.borrow() != LinkState::Up {
            return Err(TransportError::Closed);
        }
        self.state().published.push((destination.to_owned(), body.clone()));
        Ok(())
    }

    fn subscribe_raw(&self, destination: &str, on_frame: FrameHandler) -> RawSubscription {
        let mut state = self.state();
        state.next_id += 1;
        state.subscribe_calls += 1;
        let id = format!("mock-{}", state.next_id);
        state.live.insert(id.clone(), (destination.to_owned(), on_frame));
        RawSubscription { id, destination: destination.to_owned() }
    }

    fn unsubscribe_raw(&self, subscription: &RawSubscription) {
        let mut state = self.state();
        if let Some(entry) = state.live.remove(&subscription.id) {
            state.released.push(entry);
        }
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

#[must_use]
pub fn ts(raw: &str) -> Timestamp {
    Timestamp::parse(raw).expect("fixture timestamp should parse")
}

#[must_use]
pub fn message(id: &str, conversation_id: &str, created_at: &str) -> Message {
    Message {
        id: id.to_owned(),
        conversation_id: conversation_id.to_owned(),
        sender_id: "u-bob".to_owned(),
        sender_name: "bob".to_owned(),
        sender_avatar: None,
        content: MessageContent::Text(format!("text of {id}")),
        kind: MessageKind::Text,
        created_at: ts(created_at),
        is_read: false,
    }
}

#[must_use]
pub fn conversation(id: &str, counterpart: &str) -> Conversation {
    Conversation {
        id: id.to_owned(),
        participant_id: Some(format!("u-{counterpart}")),
        counterpart_name: counterpart.to_owned(),
        counterpart_avatar: None,
        last_message: None,
        last_message_time: None,
        unread_count: 0,
        is_online: false,
    }
}

/// Wire JSON for a message, as the broker would send it.
#[must_use]
pub fn message_json(msg: &Message) -> serde_json::Value {
    serde_json::to_value(msg).expect("fixture message should serialize")
}

/// Wire JSON for a history reply.
#[must_use]
pub fn history_json(conversation_id: &str, messages: &[Message]) -> serde_json::Value {
    serde_json::json!({
        "type": "HISTORY",
        "conversationId": conversation_id,
        "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
    })
}
