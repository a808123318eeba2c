//! Chat log subsystem.
//!
//! Organized into:
//! - `core`: configuration, errors, identifiers, roles and records
//! - `storage`: the `SQLite` conversation store
//! - `streaming`: assistant transport abstraction and the append coordinator
//! - `title`: best-effort title generation for new conversations

pub mod core;
pub mod storage;
pub mod streaming;
pub mod title;

pub use self::core::{
    ChatConfig, ChatError, ChatResult, Conversation, ConversationId, ConversationWithMessages,
    LlmConfig, Message, MessageId, Role, ServerConfig, StorageConfig, TitleConfig,
};
pub use storage::{ConversationStore, SqliteConversationStore};
pub use streaming::{
    AssistantTransport, Fragment, FragmentStream, StreamingAppendCoordinator, TurnEvent,
    TurnEventSender, TurnOutcome, TurnRequest,
};
pub use title::{OllamaTitleGenerator, TitleGenerator};
