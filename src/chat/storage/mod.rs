//! Persistent storage for conversations and messages.

pub mod conversation_store;

pub use conversation_store::{ConversationStore, SqliteConversationStore, StoreFuture};
