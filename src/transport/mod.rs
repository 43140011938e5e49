//! Transport binding: one framed pub/sub connection to the broker.
//!
//! DESIGN
//! ======
//! The [`Transport`] trait is the seam between the session manager and the
//! wire. `activate` is the only suspending call that can fail the caller;
//! publish and subscribe registration never block. Once activated, a
//! transport keeps itself connected (fixed-delay retries) until
//! `deactivate`, reporting drops through [`Transport::link_state`].
//!
//! Deduplication of subscriptions is not this layer's job: every
//! `subscribe_raw` call gets its own subscription id.

mod ws;

pub use ws::WsTransport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

/// Raw frame body delivered to a subscription handler.
pub type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection state of the underlying link, as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Connecting,
    Up,
}

/// Handle for one transport-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawSubscription {
    pub id: String,
    pub destination: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket-level failure while opening or using the connection.
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),

    /// The broker refused the session (ERROR frame during CONNECT).
    #[error("handshake rejected: {message}")]
    Handshake { message: String },

    /// The background connection task is not running.
    #[error("transport closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to encode body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connect(Box::new(err))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection, presenting `credential` as a bearer token in the
    /// CONNECT frame. Resolves once the broker acknowledges the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection attempt fails or the broker
    /// answers the handshake with an ERROR frame.
    async fn activate(&self, credential: &str) -> Result<(), TransportError>;

    /// Close the connection and stop retrying. Safe to call in any state.
    async fn deactivate(&self);

    /// Serialize `body` as JSON and send it to `destination`. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not active.
    fn publish(&self, destination: &str, body: &serde_json::Value) -> Result<(), TransportError>;

    /// Register `on_frame` for every MESSAGE delivered on `destination`.
    fn subscribe_raw(&self, destination: &str, on_frame: FrameHandler) -> RawSubscription;

    /// Release a subscription. Unknown handles are ignored.
    fn unsubscribe_raw(&self, subscription: &RawSubscription);

    fn link_state(&self) -> watch::Receiver<LinkState>;
}
