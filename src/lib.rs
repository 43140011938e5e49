//! Real-time chat sync over STOMP-over-WebSocket.
//!
//! Layers, bottom up: the [`transport`] binding speaks STOMP frames on one
//! socket, the [`session`] multiplexes deduplicated subscriptions and the
//! chat vocabulary over it, the [`state`] store holds everything a chat UI
//! renders, and [`sync`] runs the conversation open sequence that keeps the
//! store consistent with the broker.

pub mod api;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod session;
pub mod state;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::ChatConfig;
pub use session::{ConnectionStatus, SocketSession};
pub use state::{ChatState, ChatStore};
pub use sync::ChatSync;
