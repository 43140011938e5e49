//! Conversation open sequence: ties the socket session to the chat store.
//!
//! DESIGN
//! ======
//! `ChatSync` owns the "which conversation is open" decision. Opening a
//! conversation subscribes to its four destinations, publishes join and
//! mark-as-read, then hands the typed streams to one task that applies every
//! frame to the [`ChatStore`]. Subscribing happens before the join publish so
//! the history reply cannot arrive ahead of its subscription.
//!
//! Live messages that arrive before the history reply are held back and
//! replayed on top of it. If no reply comes within the history timeout, the
//! held messages are flushed and the loading flag cleared; a late reply
//! still replaces the list and the most recent held messages are merged in
//! again.
//!
//! LIFECYCLE
//! =========
//! 1. `new` spawns the presence forwarder and the reconnect watcher.
//! 2. `select_conversation(Some(id))` closes the previous conversation and
//!    opens `id` if the session is connected.
//! 3. Whenever the session returns to Connected, the active conversation is
//!    re-opened so join and history are replayed.
//! 4. `select_conversation(None)` or dropping the last clone releases
//!    everything.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ChatApi, MediaUploader};
use crate::protocol::{
    Attachment, Message, MessageContent, MessageKind, PresenceEvent, ReadReceipt, TypingEvent, UserQueueEvent,
};
use crate::session::{ConnectionStatus, SessionError, SocketSession, Subscription, SubscriptionHandle};
use crate::state::ChatStore;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

struct OpenConversation {
    id: String,
    handles: Vec<SubscriptionHandle>,
    task: JoinHandle<()>,
}

/// Cheap to clone; clones share one coordinator.
#[derive(Clone)]
pub struct ChatSync {
    inner: Arc<Inner>,
}

struct Inner {
    session: SocketSession,
    store: ChatStore,
    history_timeout: Duration,
    open: Mutex<Option<OpenConversation>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatSync {
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(session: SocketSession, store: ChatStore, history_timeout: Duration) -> Self {
        let presence = session.presence_events();
        // Baseline taken here, not in the task, so a connect that finishes
        // before the watcher first runs still counts as a transition.
        let mut status = session.watch_status();
        let connected = *status.borrow_and_update() == ConnectionStatus::Connected;
        let inner = Arc::new(Inner {
            session,
            store,
            history_timeout,
            open: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        });

        let forwarder = tokio::spawn(forward_presence(inner.store.clone(), presence));
        let watcher = tokio::spawn(watch_reconnects(Arc::downgrade(&inner), status, connected));
        lock(&inner.background).extend([forwarder, watcher]);

        Self { inner }
    }

    #[must_use]
    pub fn session(&self) -> &SocketSession {
        &self.inner.session
    }

    #[must_use]
    pub fn store(&self) -> &ChatStore {
        &self.inner.store
    }

    /// Id of the conversation whose subscriptions are currently live.
    #[must_use]
    pub fn open_conversation(&self) -> Option<String> {
        lock(&self.inner.open).as_ref().map(|open| open.id.clone())
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    /// Make `conversation_id` the active conversation.
    ///
    /// The previous conversation's subscriptions are released first. Opening
    /// the new one waits for the session to be connected; selecting the
    /// already-open conversation does nothing.
    pub fn select_conversation(&self, conversation_id: Option<&str>) {
        let mut open = lock(&self.inner.open);
        if let (Some(current), Some(id)) = (open.as_ref(), conversation_id) {
            if current.id == id {
                return;
            }
        }

        if let Some(previous) = open.take() {
            self.inner.close(previous);
        }
        self.inner.store.set_active_conversation(conversation_id.map(ToOwned::to_owned));

        match conversation_id {
            Some(id) if self.inner.session.status() == ConnectionStatus::Connected => {
                *open = Some(self.inner.open_sequence(id));
            }
            Some(id) => debug!(conversation_id = %id, "sync: not connected; open deferred"),
            None => {}
        }
    }

    /// Create (or find) the direct conversation with `user_id`, list it, and
    /// make it active.
    ///
    /// # Errors
    ///
    /// The REST collaborator's error.
    pub async fn start_conversation(&self, api: &dyn ChatApi, user_id: &str) -> Result<String, SyncError> {
        let conversation = api.create_conversation(user_id).await?;
        let id = conversation.id.clone();
        self.inner.store.upsert_conversation(conversation);
        self.select_conversation(Some(&id));
        Ok(id)
    }

    // =========================================================================
    // REST
    // =========================================================================

    /// Fetch the conversation list under the list-level loading flag.
    ///
    /// # Errors
    ///
    /// The REST collaborator's error; the current list is kept.
    pub async fn load_conversations(&self, api: &dyn ChatApi) -> Result<(), SyncError> {
        let store = &self.inner.store;
        store.set_loading_conversations(true);
        let result = api.conversations().await;
        store.set_loading_conversations(false);

        let conversations = result.inspect_err(|e| warn!(error = %e, "sync: conversation fetch failed"))?;
        info!(count = conversations.len(), "sync: conversations loaded");
        store.set_conversations(conversations);
        Ok(())
    }

    /// Merge one page of REST history into the store. Returns whether older
    /// pages remain.
    ///
    /// # Errors
    ///
    /// The REST collaborator's error.
    pub async fn load_history_page(
        &self,
        api: &dyn ChatApi,
        conversation_id: &str,
        page: u32,
        size: u32,
    ) -> Result<bool, SyncError> {
        let page = api.messages(conversation_id, page, size).await?;
        for message in page.messages {
            self.inner.store.add_message(message);
        }
        Ok(page.has_more)
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// # Errors
    ///
    /// [`SessionError::NotConnected`] while the session is down.
    pub fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), SyncError> {
        self.inner.session.send_message(conversation_id, &MessageContent::from(text), MessageKind::Text)?;
        Ok(())
    }

    /// Upload a file, then send the resulting attachment as structured
    /// content.
    ///
    /// # Errors
    ///
    /// The upload failure, or the publish failure once uploaded.
    pub async fn send_attachment(
        &self,
        uploader: &dyn MediaUploader,
        conversation_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, SyncError> {
        let attachment = uploader.upload(file_name, content_type, bytes).await?;
        let kind = attachment.kind;
        let content = MessageContent::from(attachment.clone());
        self.inner.session.send_message(conversation_id, &content, kind)?;
        debug!(%conversation_id, %kind, url = %attachment.url, "sync: attachment sent");
        Ok(attachment)
    }
}

// =============================================================================
// OPEN / CLOSE
// =============================================================================

impl Inner {
    fn open_sequence(&self, conversation_id: &str) -> OpenConversation {
        self.store.set_loading_messages(conversation_id, true);

        let streams = Streams {
            history: self.session.subscribe_to_user_messages(),
            messages: self.session.subscribe_to_conversation_messages(conversation_id),
            typing: self.session.subscribe_to_conversation_typing(conversation_id),
            reads: self.session.subscribe_to_conversation_read(conversation_id),
        };
        let handles = streams.handles();

        if let Err(e) = self.session.join_conversation(conversation_id) {
            warn!(%conversation_id, error = %e, "sync: join failed");
        }
        if let Err(e) = self.session.mark_as_read(conversation_id) {
            warn!(%conversation_id, error = %e, "sync: mark-as-read failed");
        }

        let apply = Apply::new(self.store.clone(), conversation_id.to_owned());
        let task = tokio::spawn(run_conversation(apply, streams, self.history_timeout));
        info!(%conversation_id, "sync: conversation opened");

        OpenConversation { id: conversation_id.to_owned(), handles, task }
    }

    fn close(&self, open: OpenConversation) {
        for handle in &open.handles {
            handle.unsubscribe();
        }
        open.task.abort();
        self.store.set_loading_messages(&open.id, false);
        info!(conversation_id = %open.id, "sync: conversation closed");
    }

    /// Re-run the open sequence for the active conversation.
    fn reopen_active(&self) {
        // Selection changes the active id under this lock.
        let mut open = lock(&self.open);
        let Some(active) = self.store.active_conversation_id() else { return };
        if let Some(previous) = open.take() {
            self.close(previous);
        }
        info!(conversation_id = %active, "sync: replaying open sequence after reconnect");
        *open = Some(self.open_sequence(&active));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
        if let Some(open) = lock(&self.open).take() {
            for handle in &open.handles {
                handle.unsubscribe();
            }
            open.task.abort();
        }
    }
}

// =============================================================================
// CONVERSATION TASK
// =============================================================================

/// Live messages kept for a late history reply after the timeout.
const HELD_LIMIT: usize = 500;

struct Streams {
    history: Subscription<UserQueueEvent>,
    messages: Subscription<Message>,
    typing: Subscription<TypingEvent>,
    reads: Subscription<ReadReceipt>,
}

impl Streams {
    fn handles(&self) -> Vec<SubscriptionHandle> {
        vec![
            self.history.handle().clone(),
            self.messages.handle().clone(),
            self.typing.handle().clone(),
            self.reads.handle().clone(),
        ]
    }
}

/// Store mutations for one open conversation.
struct Apply {
    store: ChatStore,
    conversation_id: String,
    /// Live messages seen before any history reply was applied, oldest
    /// first. Bounded by [`HELD_LIMIT`] once the timeout has flushed them.
    held: VecDeque<Message>,
    history_applied: bool,
    flushed: bool,
}

impl Apply {
    fn new(store: ChatStore, conversation_id: String) -> Self {
        Self { store, conversation_id, held: VecDeque::new(), history_applied: false, flushed: false }
    }

    fn history(&mut self, messages: Vec<Message>) {
        info!(conversation_id = %self.conversation_id, count = messages.len(), "sync: history applied");
        self.store.add_messages(&self.conversation_id, messages);
        self.history_applied = true;
        self.flush();

        self.store.update_conversation_unread_count(&self.conversation_id, 0);
        self.store.set_loading_messages(&self.conversation_id, false);
    }

    fn live(&mut self, message: Message) {
        if message.conversation_id != self.conversation_id {
            warn!(
                topic = %self.conversation_id,
                conversation_id = %message.conversation_id,
                "sync: dropping message published on another conversation's topic"
            );
            return;
        }
        if self.history_applied || self.flushed {
            self.store_live(&message);
        }
        if !self.history_applied {
            // After a timeout these are only kept for merging into a late
            // reply, so the oldest can go.
            if self.flushed && self.held.len() >= HELD_LIMIT {
                self.held.pop_front();
            }
            self.held.push_back(message);
        }
    }

    /// History never arrived; show what is held and stop waiting.
    fn timed_out(&mut self) {
        warn!(conversation_id = %self.conversation_id, held = self.held.len(), "sync: history reply timed out");
        self.flushed = true;
        for message in &self.held {
            self.store_live(message);
        }
        self.store.set_loading_messages(&self.conversation_id, false);
    }

    fn flush(&mut self) {
        if !self.held.is_empty() {
            debug!(conversation_id = %self.conversation_id, count = self.held.len(), "sync: flushing held messages");
        }
        for message in std::mem::take(&mut self.held) {
            self.store_live(&message);
        }
    }

    fn store_live(&self, message: &Message) {
        self.store.add_message(message.clone());
        self.store.update_conversation_last_message(&self.conversation_id, message.preview(), message.created_at);
    }
}

async fn run_conversation(mut apply: Apply, mut streams: Streams, history_timeout: Duration) {
    let deadline = tokio::time::sleep(history_timeout);
    tokio::pin!(deadline);
    let mut waiting = true;

    loop {
        tokio::select! {
            Some(event) = streams.history.recv() => {
                let UserQueueEvent::History(reply) = event;
                if reply.conversation_id == apply.conversation_id {
                    waiting = false;
                    apply.history(reply.messages);
                } else {
                    debug!(conversation_id = %reply.conversation_id, "sync: history for another conversation");
                }
            }
            Some(message) = streams.messages.recv() => apply.live(message),
            Some(event) = streams.typing.recv() => {
                apply.store.set_typing(&apply.conversation_id, &event.user_name, event.typing);
            }
            Some(receipt) = streams.reads.recv() => {
                debug!(conversation_id = %apply.conversation_id, reader = ?receipt.reader, "sync: read receipt");
            }
            () = &mut deadline, if waiting => {
                waiting = false;
                apply.timed_out();
            }
            else => break,
        }
    }
    debug!(conversation_id = %apply.conversation_id, "sync: conversation streams ended");
}

// =============================================================================
// BACKGROUND
// =============================================================================

async fn forward_presence(store: ChatStore, mut presence: broadcast::Receiver<PresenceEvent>) {
    loop {
        match presence.recv().await {
            Ok(event) => store.update_user_status(&event.username, event.online),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "sync: presence events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn watch_reconnects(inner: Weak<Inner>, mut status: watch::Receiver<ConnectionStatus>, mut connected: bool) {
    while status.changed().await.is_ok() {
        let now = *status.borrow_and_update() == ConnectionStatus::Connected;
        if now && !connected {
            let Some(inner) = inner.upgrade() else { break };
            inner.reopen_active();
        }
        connected = now;
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
