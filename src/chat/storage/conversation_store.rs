//! SQLite-backed conversation and message store.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::{debug, error, info};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::role::Role;
use crate::chat::core::types::{
    Conversation, ConversationWithMessages, Message, millis_to_datetime,
};

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Current time in Unix milliseconds, evaluated by `SQLite`.
const NOW_MILLIS_SQL: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

type ConversationRow = (ConversationId, Option<String>, i64);
type MessageRow = (MessageId, ConversationId, String, Role, i64);

/// Durable conversation/message storage.
///
/// Sole authority over persisted chat data. Every call reflects the current
/// persisted state; there is no caching layer.
pub trait ConversationStore: Send + Sync {
    /// Insert a new conversation, generating an id when `id` is `None`.
    ///
    /// # Errors
    /// Returns `Storage` if the id already exists or storage access fails.
    fn create_conversation(
        &self,
        title: Option<&str>,
        id: Option<ConversationId>,
    ) -> StoreFuture<'_, ChatResult<ConversationId>>;

    /// Insert a new conversation together with its first message, atomically.
    ///
    /// Nothing is written if either insert fails.
    ///
    /// # Errors
    /// Returns a storage error if storage access fails.
    fn create_conversation_with_message(
        &self,
        title: Option<&str>,
        content: &str,
        role: Role,
    ) -> StoreFuture<'_, ChatResult<Message>>;

    /// Insert a message and return the stored record.
    ///
    /// # Errors
    /// Returns `Storage` if the conversation does not exist or storage access fails.
    fn append_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        role: Role,
    ) -> StoreFuture<'_, ChatResult<Message>>;

    /// List all conversations, most recent first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_conversations(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>>;

    /// Load a conversation with its messages in replay order.
    ///
    /// # Errors
    /// Returns `NotFound` if no conversation matches.
    fn get_conversation(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<ConversationWithMessages>>;

    /// Replace the title of a conversation.
    ///
    /// # Errors
    /// Returns `NotFound` if no conversation matches.
    fn rename_conversation(&self, id: ConversationId, title: &str)
    -> StoreFuture<'_, ChatResult<()>>;

    /// Delete a conversation and every message it owns. Unknown ids are a no-op.
    ///
    /// # Errors
    /// Returns `Storage` if storage access fails.
    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>>;

    /// Check whether a conversation exists.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn conversation_exists(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<bool>>;
}

/// `SQLite` implementation of [`ConversationStore`].
pub struct SqliteConversationStore {
    conn: Arc<Connection>,
}

impl SqliteConversationStore {
    /// Initialize the store on an existing connection and create the schema.
    ///
    /// # Errors
    /// Returns an error if database operations fail.
    pub async fn new(conn: Arc<Connection>) -> ChatResult<Self> {
        conn.call(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    title TEXT,
                    created_at INTEGER NOT NULL DEFAULT ({NOW_MILLIS_SQL})
                );
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations (id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    role TEXT NOT NULL
                        CHECK (role IN ('user', 'assistant', 'system', 'data')),
                    sent_at INTEGER NOT NULL DEFAULT ({NOW_MILLIS_SQL})
                );
                CREATE INDEX IF NOT EXISTS idx_conversations_created
                    ON conversations (created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_messages_conversation_sent
                    ON messages (conversation_id, sent_at);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Open (or create) the database file at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> ChatResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::new(Arc::new(conn)).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::new(Arc::new(conn)).await
    }
}

fn conversation_from_row(row: ConversationRow) -> ChatResult<Conversation> {
    let (id, title, created_at) = row;
    Ok(Conversation {
        id,
        title,
        created_at: millis_to_datetime(created_at)?,
    })
}

fn message_from_row(row: MessageRow) -> ChatResult<Message> {
    let (id, conversation_id, content, role, sent_at) = row;
    Ok(Message {
        id,
        conversation_id,
        content,
        role,
        sent_at: millis_to_datetime(sent_at)?,
    })
}

/// `created_at` never drops below the newest conversation, so listing stays
/// most-recent-first.
fn insert_conversation(
    conn: &rusqlite::Connection,
    id: ConversationId,
    title: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO conversations (id, title, created_at)
             VALUES (?1, ?2, MAX({NOW_MILLIS_SQL}, COALESCE(
                 (SELECT MAX(created_at) FROM conversations),
                 0
             )))"
        ),
        rusqlite::params![id, title],
    )?;
    Ok(())
}

/// `sent_at` never drops below the conversation's latest message.
fn insert_message(
    conn: &rusqlite::Connection,
    conversation_id: ConversationId,
    content: &str,
    role: Role,
) -> rusqlite::Result<MessageRow> {
    let id = MessageId::new();
    conn.execute(
        &format!(
            "INSERT INTO messages (id, conversation_id, content, role, sent_at)
             VALUES (?1, ?2, ?3, ?4, MAX({NOW_MILLIS_SQL}, COALESCE(
                 (SELECT MAX(sent_at) FROM messages WHERE conversation_id = ?2),
                 0
             )))"
        ),
        rusqlite::params![id, conversation_id, content, role],
    )?;
    conn.query_row(
        "SELECT id, conversation_id, content, role, sent_at
         FROM messages WHERE id = ?1",
        rusqlite::params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )
}

impl ConversationStore for SqliteConversationStore {
    fn create_conversation(
        &self,
        title: Option<&str>,
        id: Option<ConversationId>,
    ) -> StoreFuture<'_, ChatResult<ConversationId>> {
        let title = title.map(str::to_string);
        Box::pin(async move {
            let id = id.unwrap_or_default();
            self.conn
                .call(move |conn| {
                    insert_conversation(conn, id, title.as_deref())?;
                    Ok(())
                })
                .await
                .map_err(|err| {
                    error!(conversation_id = %id, %err, "Failed to create conversation");
                    ChatError::from(err)
                })?;

            info!(conversation_id = %id, "Created conversation");
            Ok(id)
        })
    }

    fn create_conversation_with_message(
        &self,
        title: Option<&str>,
        content: &str,
        role: Role,
    ) -> StoreFuture<'_, ChatResult<Message>> {
        let title = title.map(str::to_string);
        let content = content.to_string();
        Box::pin(async move {
            let conversation_id = ConversationId::new();
            let row = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    insert_conversation(&tx, conversation_id, title.as_deref())?;
                    let row = insert_message(&tx, conversation_id, &content, role)?;
                    tx.commit()?;
                    Ok(row)
                })
                .await
                .map_err(|err| {
                    error!(%conversation_id, %role, %err, "Failed to start conversation");
                    ChatError::from(err)
                })?;

            let message = message_from_row(row)?;
            info!(%conversation_id, message_id = %message.id, "Created conversation");
            Ok(message)
        })
    }

    fn append_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        role: Role,
    ) -> StoreFuture<'_, ChatResult<Message>> {
        let content = content.to_string();
        Box::pin(async move {
            let row = self
                .conn
                .call(move |conn| Ok(insert_message(conn, conversation_id, &content, role)?))
                .await
                .map_err(|err| {
                    error!(%conversation_id, %role, %err, "Error adding message");
                    ChatError::from(err)
                })?;

            let message = message_from_row(row)?;
            debug!(%conversation_id, message_id = %message.id, %role, "Appended message");
            Ok(message)
        })
    }

    fn list_conversations(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, title, created_at
                         FROM conversations
                         ORDER BY created_at DESC, rowid DESC",
                    )?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                        .collect::<Result<Vec<ConversationRow>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;

            rows.into_iter().map(conversation_from_row).collect()
        })
    }

    fn get_conversation(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<ConversationWithMessages>> {
        Box::pin(async move {
            let found = self
                .conn
                .call(move |conn| {
                    let conversation: Option<ConversationRow> = conn
                        .query_row(
                            "SELECT id, title, created_at FROM conversations WHERE id = ?1",
                            rusqlite::params![id],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        )
                        .optional()?;
                    let Some(conversation) = conversation else {
                        return Ok(None);
                    };

                    let mut stmt = conn.prepare(
                        "SELECT id, conversation_id, content, role, sent_at
                         FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY sent_at ASC, rowid ASC",
                    )?;
                    let messages = stmt
                        .query_map(rusqlite::params![id], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                        })?
                        .collect::<Result<Vec<MessageRow>, rusqlite::Error>>()?;
                    Ok(Some((conversation, messages)))
                })
                .await?;

            let (conversation, messages) = found.ok_or_else(|| ChatError::not_found(id))?;
            Ok(ConversationWithMessages {
                conversation: conversation_from_row(conversation)?,
                messages: messages
                    .into_iter()
                    .map(message_from_row)
                    .collect::<ChatResult<Vec<_>>>()?,
            })
        })
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> StoreFuture<'_, ChatResult<()>> {
        let title = title.to_string();
        Box::pin(async move {
            let changed = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        "UPDATE conversations SET title = ?1 WHERE id = ?2",
                        rusqlite::params![title, id],
                    )?;
                    Ok(changed)
                })
                .await
                .map_err(|err| {
                    error!(conversation_id = %id, %err, "Error renaming conversation");
                    ChatError::from(err)
                })?;

            if changed == 0 {
                return Err(ChatError::not_found(id));
            }
            debug!(conversation_id = %id, "Renamed conversation");
            Ok(())
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let removed = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let messages = tx.execute(
                        "DELETE FROM messages WHERE conversation_id = ?1",
                        rusqlite::params![id],
                    )?;
                    let conversations = tx.execute(
                        "DELETE FROM conversations WHERE id = ?1",
                        rusqlite::params![id],
                    )?;
                    tx.commit()?;
                    Ok((conversations, messages))
                })
                .await
                .map_err(|err| {
                    error!(conversation_id = %id, %err, "Error deleting conversation");
                    ChatError::from(err)
                })?;

            let (conversations, messages) = removed;
            if conversations == 0 {
                debug!(conversation_id = %id, "Delete of unknown conversation ignored");
            } else {
                info!(conversation_id = %id, messages, "Deleted conversation");
            }
            Ok(())
        })
    }

    fn conversation_exists(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<bool>> {
        Box::pin(async move {
            let exists = self
                .conn
                .call(move |conn| {
                    let count: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )?;
                    Ok(count > 0)
                })
                .await?;
            Ok(exists)
        })
    }
}
