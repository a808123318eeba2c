//! Error types for the chat log core.

use thiserror::Error;

/// Chat log error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No conversation matches the requested identifier.
    #[error("conversation not found: {id}")]
    NotFound {
        /// The identifier that was looked up.
        id: String,
    },
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// HTTP failure talking to the assistant endpoint.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The assistant endpoint reported an error or the stream was interrupted.
    #[error("transport error: {0}")]
    Transport(String),
    /// HTTP client error from Rig.
    #[error("http client error: {0}")]
    HttpClient(#[from] rig::http_client::Error),
    /// Completion error.
    #[error("completion error: {0}")]
    Completion(#[from] rig::completion::CompletionError),
    /// Title generation produced nothing usable.
    #[error("title generation error: {0}")]
    Title(String),
    /// A built-in pattern failed to compile.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// Caller supplied unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A stored row could not be decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl ChatError {
    /// Build a `NotFound` error for any displayable id.
    #[must_use]
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Whether this error reports a missing conversation.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the store failed (I/O, constraint, foreign key).
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::TokioSqlite(_))
    }

    /// Whether the assistant endpoint failed.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Transport(_))
    }
}

/// Convenience result alias for chat log operations.
pub type ChatResult<T> = Result<T, ChatError>;
