//! Socket session manager.
//!
//! DESIGN
//! ======
//! `SocketSession` owns one [`Transport`] for an authenticated session and
//! multiplexes logical subscriptions over it. The registry is keyed by
//! destination string and holds at most one transport-level subscription
//! per destination; every caller interested in a destination is attached
//! to that one entry as a listener.
//!
//! Frames are decoded into the destination's payload type before any
//! listener sees them. A body that does not decode is logged and dropped.
//!
//! Handles carry the generation of the entry they were issued for, so a
//! handle kept past a release-and-resubscribe cannot tear down the newer
//! subscription.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::protocol::{
    Destination, JoinRequest, Message, MessageContent, MessageKind, PresenceEvent, ReadReceipt, ReadRequest,
    SendRequest, TypingEvent, TypingRequest, UserQueueEvent, decode_payload,
};
use crate::transport::{FrameHandler, LinkState, RawSubscription, Transport, TransportError};

const PRESENCE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No token was passed and the auth collaborator has none.
    #[error("no bearer token available")]
    MissingToken,

    #[error("session is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

struct Tracked {
    raw: RawSubscription,
    generation: u64,
    listeners: Vec<Listener>,
}

// =============================================================================
// SESSION
// =============================================================================

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SocketSession {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    registry: Mutex<HashMap<String, Tracked>>,
    next_generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    presence: broadcast::Sender<PresenceEvent>,
    connect_lock: tokio::sync::Mutex<()>,
    link_task: Mutex<Option<JoinHandle<()>>>,
    presence_sub: Mutex<Option<SubscriptionHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketSession {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<dyn TokenProvider>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (presence, _) = broadcast::channel(PRESENCE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                tokens,
                registry: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                status,
                presence,
                connect_lock: tokio::sync::Mutex::new(()),
                link_task: Mutex::new(None),
                presence_sub: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Observe status changes; the UI can disable input while not connected.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Presence events from the user-scoped queue subscribed at connect time.
    #[must_use]
    pub fn presence_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.presence.subscribe()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open the session. Without `token`, the auth collaborator is asked for
    /// the current one. Resolves once the link is up, which after a drop
    /// may mean waiting out the transport's retries. A no-op when already
    /// connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::MissingToken`] when no token is available, or the
    /// transport's error when the handshake fails.
    pub async fn connect(&self, token: Option<&str>) -> Result<(), SessionError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let token = match token {
            Some(token) => token.to_owned(),
            None => self.inner.tokens.bearer_token().ok_or(SessionError::MissingToken)?,
        };

        self.inner.set_status(ConnectionStatus::Connecting);
        if let Err(e) = self.inner.transport.activate(&token).await {
            warn!(error = %e, "session: connect failed");
            self.inner.set_status(ConnectionStatus::Disconnected);
            return Err(e.into());
        }

        // A transport that was already retrying reports success at once.
        let mut link = self.inner.transport.link_state();
        if *link.borrow_and_update() != LinkState::Up {
            debug!("session: waiting for link");
            let up = link.wait_for(|state| *state == LinkState::Up).await.map(|_| ());
            if up.is_err() {
                self.inner.set_status(ConnectionStatus::Disconnected);
                return Err(TransportError::Closed.into());
            }
        }
        self.inner.set_status(ConnectionStatus::Connected);
        info!("session: connected");

        self.subscribe_presence();
        self.spawn_link_watch(link);
        Ok(())
    }

    /// Release every tracked subscription, then close the transport.
    /// Safe to call in any state.
    pub async fn disconnect(&self) {
        if let Some(task) = lock(&self.inner.link_task).take() {
            task.abort();
        }

        let drained: Vec<(String, Tracked)> = lock(&self.inner.registry).drain().collect();
        for (destination, tracked) in &drained {
            self.inner.transport.unsubscribe_raw(&tracked.raw);
            debug!(%destination, "session: released on disconnect");
        }

        self.inner.transport.deactivate().await;
        self.inner.set_status(ConnectionStatus::Disconnected);
        info!(released = drained.len(), "session: disconnected");
    }

    /// At most one presence listener per session; a reconnect that kept the
    /// registry keeps the existing one.
    fn subscribe_presence(&self) {
        let mut slot = lock(&self.inner.presence_sub);
        if slot.as_ref().is_some_and(|handle| self.inner.is_live(handle)) {
            return;
        }
        let presence = self.inner.presence.clone();
        let handle = self.subscribe_with(&Destination::Presence, move |event: PresenceEvent| {
            // No receivers is fine.
            let _ = presence.send(event);
        });
        *slot = Some(handle);
    }

    /// Mirror transport link changes into the session status.
    fn spawn_link_watch(&self, mut link: watch::Receiver<LinkState>) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while link.changed().await.is_ok() {
                let state = *link.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                match state {
                    LinkState::Up => info!("session: link up"),
                    LinkState::Down => warn!("session: link down"),
                    LinkState::Connecting => debug!("session: link connecting"),
                }
                inner.set_status(status_for(state));
            }
        });
        if let Some(previous) = lock(&self.inner.link_task).replace(task) {
            previous.abort();
        }
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Attach `callback` to `destination`. Repeated calls for one destination
    /// share a single transport-level subscription and return equal handles.
    pub fn subscribe_with<T, F>(&self, destination: &Destination, callback: F) -> SubscriptionHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let key = destination.to_string();
        let dest = key.clone();
        let listener: Listener = Arc::new(move |body: &str| match decode_payload::<T>(&dest, body) {
            Ok(value) => callback(value),
            Err(e) => warn!(error = %e, "session: dropping malformed frame"),
        });
        Inner::attach(&self.inner, key, listener)
    }

    /// Stream form of [`subscribe_with`](Self::subscribe_with). The stream
    /// ends once the destination is released.
    pub fn subscribe<T>(&self, destination: &Destination) -> Subscription<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe_with(destination, move |value: T| {
            let _ = tx.send(value);
        });
        Subscription { handle, rx }
    }

    /// Release `destination` regardless of which handle created it.
    pub fn unsubscribe(&self, destination: &Destination) {
        self.inner.release(&destination.to_string(), None);
    }

    /// Destinations currently tracked, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.registry).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// History replies on the user-scoped queue.
    pub fn subscribe_to_user_messages(&self) -> Subscription<UserQueueEvent> {
        self.subscribe(&Destination::ConversationHistory)
    }

    pub fn subscribe_to_conversation_messages(&self, conversation_id: &str) -> Subscription<Message> {
        self.subscribe(&Destination::ConversationMessages(conversation_id.to_owned()))
    }

    pub fn subscribe_to_conversation_typing(&self, conversation_id: &str) -> Subscription<TypingEvent> {
        self.subscribe(&Destination::ConversationTyping(conversation_id.to_owned()))
    }

    pub fn subscribe_to_conversation_read(&self, conversation_id: &str) -> Subscription<ReadReceipt> {
        self.subscribe(&Destination::ConversationRead(conversation_id.to_owned()))
    }

    // =========================================================================
    // CHAT VOCABULARY
    // =========================================================================

    /// Publish `body` as JSON. Dropped with a warning while not connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when the session is not connected, or a
    /// transport error if the body cannot be encoded or the link is gone.
    pub fn publish<B: Serialize>(&self, destination: &Destination, body: &B) -> Result<(), SessionError> {
        if self.status() != ConnectionStatus::Connected {
            warn!(%destination, "session: not connected; dropping publish");
            return Err(SessionError::NotConnected);
        }
        let value = serde_json::to_value(body).map_err(TransportError::from)?;
        self.inner
            .transport
            .publish(&destination.to_string(), &value)
            .inspect_err(|e| warn!(%destination, error = %e, "session: publish failed"))?;
        Ok(())
    }

    /// Enroll in the conversation's fan-out; the broker answers with history.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub fn join_conversation(&self, conversation_id: &str) -> Result<(), SessionError> {
        self.publish(&Destination::Join, &JoinRequest { conversation_id })
    }

    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: &MessageContent,
        kind: MessageKind,
    ) -> Result<(), SessionError> {
        self.publish(&Destination::Send, &SendRequest { conversation_id, content, kind })
    }

    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub fn set_typing(&self, conversation_id: &str, typing: bool) -> Result<(), SessionError> {
        self.publish(&Destination::Typing, &TypingRequest { conversation_id, typing })
    }

    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub fn mark_as_read(&self, conversation_id: &str) -> Result<(), SessionError> {
        self.publish(&Destination::Read, &ReadRequest { conversation_id })
    }
}

fn status_for(state: LinkState) -> ConnectionStatus {
    match state {
        LinkState::Up => ConnectionStatus::Connected,
        LinkState::Connecting => ConnectionStatus::Connecting,
        LinkState::Down => ConnectionStatus::Disconnected,
    }
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn attach(this: &Arc<Self>, key: String, listener: Listener) -> SubscriptionHandle {
        let mut registry = lock(&this.registry);
        if let Some(tracked) = registry.get_mut(&key) {
            tracked.listeners.push(listener);
            debug!(destination = %key, listeners = tracked.listeners.len(), "session: reusing subscription");
            return SubscriptionHandle { session: Arc::downgrade(this), destination: key, generation: tracked.generation };
        }

        let generation = this.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(this);
        let dest = key.clone();
        let on_frame: FrameHandler = Arc::new(move |body: &str| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(&dest, body);
            }
        });
        let raw = this.transport.subscribe_raw(&key, on_frame);
        registry.insert(key.clone(), Tracked { raw, generation, listeners: vec![listener] });
        info!(destination = %key, generation, "session: subscribed");

        SubscriptionHandle { session: Arc::downgrade(this), destination: key, generation }
    }

    fn is_live(&self, handle: &SubscriptionHandle) -> bool {
        lock(&self.registry).get(&handle.destination).is_some_and(|tracked| tracked.generation == handle.generation)
    }

    /// Fan a frame out to the destination's listeners, outside the lock.
    fn deliver(&self, destination: &str, body: &str) {
        let listeners = lock(&self.registry)
            .get(destination)
            .map(|tracked| tracked.listeners.clone())
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(%destination, "session: frame for untracked destination");
        }
        for listener in listeners {
            listener(body);
        }
    }

    fn release(&self, destination: &str, generation: Option<u64>) {
        let removed = {
            let mut registry = lock(&self.registry);
            match registry.get(destination) {
                Some(tracked) if generation.is_none_or(|g| g == tracked.generation) => registry.remove(destination),
                Some(tracked) => {
                    debug!(%destination, stale = ?generation, current = tracked.generation, "session: ignoring stale unsubscribe");
                    None
                }
                None => None,
            }
        };
        if let Some(tracked) = removed {
            self.transport.unsubscribe_raw(&tracked.raw);
            info!(%destination, "session: unsubscribed");
        }
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Release capability for one tracked destination.
#[derive(Clone)]
pub struct SubscriptionHandle {
    session: Weak<Inner>,
    destination: String,
    generation: u64,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Remove the tracked entry and release the transport subscription.
    /// Does nothing if the destination has since been re-subscribed.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.session.upgrade() {
            inner.release(&self.destination, Some(self.generation));
        }
    }
}

impl PartialEq for SubscriptionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination && self.generation == other.generation
    }
}

impl Eq for SubscriptionHandle {}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("destination", &self.destination)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Typed stream of payloads from one destination.
pub struct Subscription<T> {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next payload, or `None` once the destination is released.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl<T> Unpin for Subscription<T> {}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
