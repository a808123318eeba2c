//! Configuration for the chat log.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::{ChatError, ChatResult};

/// Environment variable overriding the `SQLite` path.
pub const DB_PATH_ENV: &str = "CHATLOG_DB_PATH";
/// Environment variable overriding the Ollama base URL (e.g. `http://10.0.0.2:11434`).
pub const OLLAMA_URL_ENV: &str = "CHATLOG_OLLAMA_URL";
/// Environment variable overriding the chat model.
pub const MODEL_ENV: &str = "CHATLOG_MODEL";
/// Environment variable overriding the HTTP port.
pub const PORT_ENV: &str = "CHATLOG_PORT";

/// Default Ollama API base URL.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Assistant model settings.
    pub llm: LlmConfig,
    /// Title generation settings.
    pub title: TitleConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

impl ChatConfig {
    /// Build the default configuration with overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the default configuration with overrides from `lookup`.
    ///
    /// Unparseable port values are ignored.
    #[must_use]
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup(DB_PATH_ENV) {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(url) = lookup(OLLAMA_URL_ENV) {
            config.llm.base_url = Some(url);
        }
        if let Some(model) = lookup(MODEL_ENV) {
            config.llm.model = model;
        }
        if let Some(port) = lookup(PORT_ENV).and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }
        config
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        if self.llm.model.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "llm.model must not be empty".to_string(),
            ));
        }

        if self.title.max_chars == 0 {
            return Err(ChatError::InvalidConfig(
                "title.max_chars must be > 0".to_string(),
            ));
        }

        if self.title.seed_chars == 0 {
            return Err(ChatError::InvalidConfig(
                "title.seed_chars must be > 0".to_string(),
            ));
        }

        if let Some(base_url) = &self.llm.base_url {
            Url::parse(base_url)
                .map_err(|err| ChatError::InvalidConfig(format!("llm.base_url: {err}")))?;
        }

        Ok(())
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("chatlog.sqlite"),
        }
    }
}

/// Assistant model settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Ollama model name.
    pub model: String,
    /// Temperature for title generation.
    pub temperature: f64,
    /// Optional custom base URL.
    pub base_url: Option<String>,
}

impl LlmConfig {
    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url_or_default(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(DEFAULT_OLLAMA_URL)
            .trim_end_matches('/')
            .to_string()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "ministral-3:8b-instruct-2512-q8_0".to_string(),
            temperature: 0.3,
            base_url: None,
        }
    }
}

/// Title generation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TitleConfig {
    /// Whether new conversations get a generated title.
    pub enabled: bool,
    /// Maximum title length in characters.
    pub max_chars: usize,
    /// How much of the first user message is sent to the model.
    pub seed_chars: usize,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: 50,
            seed_chars: 200,
        }
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}
