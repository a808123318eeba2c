//! Persisted conversation and message records.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::role::Role;

/// A titled, timestamped container for an ordered sequence of messages.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable identifier.
    pub id: ConversationId,
    /// Human-readable title, absent until generated or renamed.
    pub title: Option<String>,
    /// Creation time, assigned by the store.
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Title to show in a conversation list.
    ///
    /// Falls back to `Chat from <date>` while no title has been set.
    #[must_use]
    pub fn display_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => format!("Chat from {}", self.created_at.format("%b %d, %Y")),
        }
    }
}

/// One turn's full text content.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Full text; never a partial fragment.
    pub content: String,
    /// Who produced the message.
    pub role: Role,
    /// Insertion time, assigned by the store. Defines replay order.
    pub sent_at: DateTime<Utc>,
}

/// A conversation together with its messages in replay order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationWithMessages {
    /// Conversation fields.
    #[serde(flatten)]
    pub conversation: Conversation,
    /// Messages ordered by `sent_at` ascending.
    pub messages: Vec<Message>,
}

/// Convert stored Unix milliseconds into a UTC timestamp.
///
/// # Errors
/// Returns `InvalidRecord` if the value is out of range.
pub fn millis_to_datetime(millis: i64) -> ChatResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ChatError::InvalidRecord(format!("invalid timestamp: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(title: Option<&str>) -> Conversation {
        Conversation {
            id: ConversationId::new(),
            title: title.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2025, 3, 7, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_display_title_prefers_title() {
        assert_eq!(conversation(Some("Trip plans")).display_title(), "Trip plans");
    }

    #[test]
    fn test_display_title_falls_back_to_date() {
        assert_eq!(conversation(None).display_title(), "Chat from Mar 07, 2025");
        assert_eq!(conversation(Some("   ")).display_title(), "Chat from Mar 07, 2025");
    }

    #[test]
    fn test_millis_to_datetime() {
        let ts = millis_to_datetime(1_700_000_000_123).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert!(millis_to_datetime(i64::MAX).is_err());
    }

    #[test]
    fn test_with_messages_flattens() {
        let conv = conversation(Some("Hi"));
        let value = serde_json::to_value(ConversationWithMessages {
            conversation: conv.clone(),
            messages: Vec::new(),
        })
        .unwrap();
        assert_eq!(value["id"], serde_json::json!(conv.id.to_string()));
        assert_eq!(value["title"], serde_json::json!("Hi"));
        assert!(value["messages"].as_array().unwrap().is_empty());
    }
}
