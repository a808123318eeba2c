//! Core chat types and identifiers.

pub mod config;
pub mod errors;
pub mod ids;
pub mod role;
pub mod types;

pub use config::{ChatConfig, LlmConfig, ServerConfig, StorageConfig, TitleConfig};
pub use errors::{ChatError, ChatResult};
pub use ids::{ConversationId, MessageId};
pub use role::{Role, RoleParseError};
pub use types::{Conversation, ConversationWithMessages, Message, millis_to_datetime};
