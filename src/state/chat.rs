//! Chat state and its transformations.
//!
//! Every operation is synchronous and does no I/O. Message lists are held
//! behind `Arc` so cloning a `ChatState` to publish a new snapshot copies
//! only the lists that an operation actually touches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::protocol::{Conversation, Message, Timestamp};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    conversations: Vec<Conversation>,
    active_conversation_id: Option<String>,
    messages: HashMap<String, Arc<Vec<Message>>>,
    loading_conversations: bool,
    loading_messages: HashSet<String>,
    /// `(conversation_id, username)` pairs currently typing.
    typing: HashSet<(String, String)>,
}

impl ChatState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // READS
    // =========================================================================

    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    #[must_use]
    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active_conversation_id.as_deref()
    }

    #[must_use]
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active_conversation_id.as_deref().and_then(|id| self.conversation(id))
    }

    /// Messages of a conversation, ascending by `created_at`. Empty when the
    /// list was never loaded.
    #[must_use]
    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.messages.get(conversation_id).map(|list| list.as_slice()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_loading_conversations(&self) -> bool {
        self.loading_conversations
    }

    #[must_use]
    pub fn is_loading_messages(&self, conversation_id: &str) -> bool {
        self.loading_messages.contains(conversation_id)
    }

    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, username: &str) -> bool {
        self.typing.contains(&(conversation_id.to_owned(), username.to_owned()))
    }

    /// Usernames typing in a conversation, sorted.
    #[must_use]
    pub fn typing_users(&self, conversation_id: &str) -> Vec<&str> {
        let mut users: Vec<&str> = self
            .typing
            .iter()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, user)| user.as_str())
            .collect();
        users.sort_unstable();
        users
    }

    // =========================================================================
    // CONVERSATIONS
    // =========================================================================

    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }

    /// Replace a known conversation in place, or prepend a new one.
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.insert(0, conversation),
        }
    }

    /// Only changes the selection; opening the conversation on the socket is
    /// the caller's job.
    pub fn set_active_conversation(&mut self, conversation_id: Option<String>) {
        self.active_conversation_id = conversation_id;
    }

    pub fn update_conversation_last_message(&mut self, conversation_id: &str, preview: String, at: Timestamp) {
        if let Some(conv) = self.conversation_mut(conversation_id) {
            conv.last_message = Some(preview);
            conv.last_message_time = Some(at);
        }
    }

    /// Absolute set; callers compute any delta.
    pub fn update_conversation_unread_count(&mut self, conversation_id: &str, count: u32) {
        if let Some(conv) = self.conversation_mut(conversation_id) {
            conv.unread_count = count;
        }
    }

    /// Project a presence event onto every conversation with that counterpart.
    pub fn update_user_status(&mut self, username: &str, online: bool) {
        for conv in self.conversations.iter_mut().filter(|c| c.counterpart_name == username) {
            conv.is_online = online;
        }
    }

    pub fn set_loading_conversations(&mut self, loading: bool) {
        self.loading_conversations = loading;
    }

    fn conversation_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == conversation_id)
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Replace a conversation's list wholesale (history replay).
    ///
    /// The batch is expected sorted; it is stable-sorted anyway, and a
    /// repeated id keeps its last copy.
    pub fn add_messages(&mut self, conversation_id: &str, messages: Vec<Message>) {
        let mut list: Vec<Message> = Vec::with_capacity(messages.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(messages.len());
        for msg in messages {
            match index.get(&msg.id) {
                Some(&at) => list[at] = msg,
                None => {
                    index.insert(msg.id.clone(), list.len());
                    list.push(msg);
                }
            }
        }
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.messages.insert(conversation_id.to_owned(), Arc::new(list));
    }

    /// Merge one live message into its conversation's list.
    ///
    /// A message whose id is already present replaces the old copy. The
    /// message lands after every entry with an equal or earlier timestamp.
    /// Returns false when the id was already present.
    pub fn add_message(&mut self, message: Message) -> bool {
        let list = Arc::make_mut(self.messages.entry(message.conversation_id.clone()).or_default());
        let existing = list.iter().position(|m| m.id == message.id);
        if let Some(pos) = existing {
            list.remove(pos);
        }
        let at = list.partition_point(|m| m.created_at <= message.created_at);
        list.insert(at, message);
        existing.is_none()
    }

    pub fn clear_messages(&mut self, conversation_id: &str) {
        self.messages.remove(conversation_id);
    }

    pub fn set_loading_messages(&mut self, conversation_id: &str, loading: bool) {
        if loading {
            self.loading_messages.insert(conversation_id.to_owned());
        } else {
            self.loading_messages.remove(conversation_id);
        }
    }

    pub fn set_typing(&mut self, conversation_id: &str, username: &str, typing: bool) {
        let key = (conversation_id.to_owned(), username.to_owned());
        if typing {
            self.typing.insert(key);
        } else {
            self.typing.remove(&key);
        }
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
