//! Application state shared across all request handlers.

use std::sync::Arc;

use tracing::info;

use crate::chat::core::config::ChatConfig;
use crate::chat::core::errors::ChatResult;
use crate::chat::storage::{ConversationStore, SqliteConversationStore};
use crate::chat::streaming::StreamingAppendCoordinator;
use crate::chat::title::OllamaTitleGenerator;
use crate::llm::OllamaTransport;

/// Shared application state.
pub struct AppState {
    /// Turn coordinator; owns the store and the assistant transport.
    pub coordinator: Arc<StreamingAppendCoordinator>,
    /// Effective configuration.
    pub config: ChatConfig,
}

impl AppState {
    /// Open the store and wire the Ollama transport and title generator.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or a client cannot be built.
    pub async fn new(config: ChatConfig) -> ChatResult<Arc<Self>> {
        let store = SqliteConversationStore::open(&config.storage.sqlite_path).await?;
        info!(path = %config.storage.sqlite_path.display(), "Conversation store opened");

        let transport = OllamaTransport::new(&config.llm)?;
        let mut coordinator = StreamingAppendCoordinator::new(Arc::new(store), Arc::new(transport));
        if config.title.enabled {
            let titles = OllamaTitleGenerator::new(&config.llm, &config.title)?;
            coordinator = coordinator.with_title_generator(Arc::new(titles));
        }

        Ok(Self::from_parts(Arc::new(coordinator), config))
    }

    /// Build the state around an existing coordinator.
    #[must_use]
    pub fn from_parts(coordinator: Arc<StreamingAppendCoordinator>, config: ChatConfig) -> Arc<Self> {
        Arc::new(Self { coordinator, config })
    }

    /// Store shared with the coordinator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        self.coordinator.store()
    }
}
