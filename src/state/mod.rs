//! Conversation state: pure transformations plus the observable store
//! that the session callbacks and UI handlers mutate.

mod chat;
mod store;

pub use chat::ChatState;
pub use store::ChatStore;
