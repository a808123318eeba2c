//! Turn requests, live events and outcomes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat::core::ids::ConversationId;
use crate::chat::core::types::Message;

/// Sink for live turn events. Dropping the receiver cancels the turn.
pub type TurnEventSender = mpsc::UnboundedSender<TurnEvent>;

/// A user submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Target conversation; `None` starts a new one.
    pub conversation_id: Option<ConversationId>,
    /// Text typed by the user.
    pub content: String,
}

impl TurnRequest {
    /// Start a brand-new conversation with `content`.
    #[must_use]
    pub fn new_conversation(content: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            content: content.into(),
        }
    }

    /// Continue an existing conversation with `content`.
    #[must_use]
    pub fn follow_up(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            content: content.into(),
        }
    }
}

/// Live progress of a turn, in the order it happens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The user message was written.
    UserPersisted {
        /// Stored user message.
        message: Message,
    },
    /// A text fragment arrived from the transport.
    Fragment {
        /// Fragment text.
        text: String,
    },
    /// The assistant reply was written.
    AssistantPersisted {
        /// Stored assistant message.
        message: Message,
    },
    /// A generated title was written for a new conversation.
    TitleGenerated {
        /// Conversation that was renamed.
        conversation_id: ConversationId,
        /// New title.
        title: String,
    },
}

/// Terminal state of a turn that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream completed and exactly one assistant message was written.
    Completed {
        /// Conversation the turn belongs to.
        conversation_id: ConversationId,
        /// Stored user message.
        user_message: Message,
        /// Stored assistant message.
        assistant_message: Message,
    },
    /// The turn was cancelled; no assistant message was written.
    Cancelled {
        /// Conversation the turn belongs to.
        conversation_id: ConversationId,
        /// Stored user message.
        user_message: Message,
    },
}

impl TurnOutcome {
    /// Conversation the turn belongs to.
    #[must_use]
    pub const fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Completed {
                conversation_id, ..
            }
            | Self::Cancelled {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}
