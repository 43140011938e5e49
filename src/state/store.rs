//! Observable chat store.
//!
//! DESIGN
//! ======
//! The current [`ChatState`] lives in a `watch` channel as an `Arc`. Every
//! operation builds the next state from a clone, then publishes it as a new
//! `Arc`, so observers detect change by pointer and a snapshot held by a
//! renderer is never mutated underneath it. Writers are serialized by a
//! mutex so concurrent operations cannot lose each other's updates.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use super::ChatState;
use crate::protocol::{Conversation, Message, Timestamp};

/// Cheap to clone; clones share one store.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<Arc<ChatState>>,
    write: Mutex<()>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(ChatState::new()));
        Self { inner: Arc::new(Inner { tx, write: Mutex::new(()) }) }
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ChatState> {
        Arc::clone(&self.inner.tx.borrow())
    }

    /// Receiver notified after every operation.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<ChatState>> {
        self.inner.tx.subscribe()
    }

    fn apply<R>(&self, op: impl FnOnce(&mut ChatState) -> R) -> R {
        let _write = self.inner.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = ChatState::clone(&self.inner.tx.borrow());
        let out = op(&mut next);
        self.inner.tx.send_replace(Arc::new(next));
        out
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.apply(|s| s.set_conversations(conversations));
    }

    pub fn upsert_conversation(&self, conversation: Conversation) {
        self.apply(|s| s.upsert_conversation(conversation));
    }

    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        self.apply(|s| s.set_active_conversation(conversation_id));
    }

    pub fn add_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.apply(|s| s.add_messages(conversation_id, messages));
    }

    /// Returns false when the message id was already stored.
    pub fn add_message(&self, message: Message) -> bool {
        self.apply(|s| s.add_message(message))
    }

    pub fn clear_messages(&self, conversation_id: &str) {
        self.apply(|s| s.clear_messages(conversation_id));
    }

    pub fn update_conversation_last_message(&self, conversation_id: &str, preview: String, at: Timestamp) {
        self.apply(|s| s.update_conversation_last_message(conversation_id, preview, at));
    }

    pub fn update_conversation_unread_count(&self, conversation_id: &str, count: u32) {
        self.apply(|s| s.update_conversation_unread_count(conversation_id, count));
    }

    pub fn set_typing(&self, conversation_id: &str, username: &str, typing: bool) {
        self.apply(|s| s.set_typing(conversation_id, username, typing));
    }

    pub fn set_loading_conversations(&self, loading: bool) {
        self.apply(|s| s.set_loading_conversations(loading));
    }

    pub fn set_loading_messages(&self, conversation_id: &str, loading: bool) {
        self.apply(|s| s.set_loading_messages(conversation_id, loading));
    }

    pub fn update_user_status(&self, username: &str, online: bool) {
        self.apply(|s| s.update_user_status(username, online));
    }

    // =========================================================================
    // READS
    // =========================================================================

    #[must_use]
    pub fn active_conversation_id(&self) -> Option<String> {
        self.snapshot().active_conversation_id().map(ToOwned::to_owned)
    }

    #[must_use]
    pub fn active_conversation(&self) -> Option<Conversation> {
        self.snapshot().active_conversation().cloned()
    }

    #[must_use]
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.snapshot().messages(conversation_id).to_vec()
    }

    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, username: &str) -> bool {
        self.snapshot().is_typing(conversation_id, username)
    }

    #[must_use]
    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.snapshot().typing_users(conversation_id).into_iter().map(ToOwned::to_owned).collect()
    }

    #[must_use]
    pub fn is_loading_messages(&self, conversation_id: &str) -> bool {
        self.snapshot().is_loading_messages(conversation_id)
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
