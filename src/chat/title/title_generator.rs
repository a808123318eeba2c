//! Conversation title generation.
//!
//! Best-effort: the coordinator logs and ignores every failure from here.

use std::future::Future;
use std::pin::Pin;

use regex::Regex;
use reqwest::Client as ReqwestClient;
use rig::client::CompletionClient;
use rig::completion::CompletionModel;
use rig::message::AssistantContent;
use rig::providers::ollama;
use tracing::debug;

use crate::chat::core::config::{LlmConfig, TitleConfig};
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::ConversationId;

/// System prompt for title generation.
const TITLE_SYSTEM_PROMPT: &str = "You name chat conversations. \
Output ONLY the title, nothing else. No quotes, no punctuation at the end. \
Do not use asterisks or any special formatting.";

/// Boxed future type for title generation.
pub type TitleFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Derives a human-readable title from the first user message.
pub trait TitleGenerator: Send + Sync {
    /// Produce a title for `conversation_id` from `seed`.
    ///
    /// # Errors
    /// Returns `Title` if generation fails or yields nothing usable.
    fn generate(
        &self,
        conversation_id: ConversationId,
        seed: String,
    ) -> TitleFuture<'_, ChatResult<String>>;
}

/// Normalizes raw model output into a display title.
#[derive(Clone, Debug)]
pub struct TitleCleaner {
    prefix: Regex,
    whitespace: Regex,
    max_chars: usize,
}

impl TitleCleaner {
    /// Create a cleaner that truncates to `max_chars`.
    ///
    /// # Errors
    /// Returns an error if a pattern fails to compile.
    pub fn new(max_chars: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            prefix: Regex::new(r"(?i)^title\s*:\s*")?,
            whitespace: Regex::new(r"\s+")?,
            max_chars,
        })
    }

    /// Clean up a model answer: first non-empty line, no label, quotes,
    /// asterisks or trailing punctuation, single spaces, bounded length.
    #[must_use]
    pub fn clean(&self, raw: &str) -> String {
        let line = raw
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        let line = self.prefix.replace(line, "");
        let line = line
            .trim_matches(|c: char| c == '"' || c == '*' || c == '\'' || c.is_whitespace())
            .trim_end_matches(['.', '!', '?', ':']);
        let line = self.whitespace.replace_all(line, " ");

        let title: String = line.chars().take(self.max_chars).collect();
        title.trim_end().to_string()
    }
}

/// Build the user prompt from the first `seed_chars` characters of the seed.
#[must_use]
pub fn build_title_prompt(seed: &str, seed_chars: usize) -> String {
    format!(
        "Generate a very short title (3-6 words maximum) for a conversation that starts with this message.\n\nUser: {}\n\nTitle:",
        seed.chars().take(seed_chars).collect::<String>()
    )
}

/// Title generator backed by an Ollama completion model.
pub struct OllamaTitleGenerator {
    model: ollama::CompletionModel,
    temperature: f64,
    seed_chars: usize,
    cleaner: TitleCleaner,
}

impl OllamaTitleGenerator {
    /// Create a generator from the model and title settings.
    ///
    /// # Errors
    /// Returns an error if the Ollama client cannot be built.
    pub fn new(llm: &LlmConfig, title: &TitleConfig) -> ChatResult<Self> {
        let builder = ollama::Client::<ReqwestClient>::builder().api_key(rig::client::Nothing);
        let builder = if let Some(base_url) = &llm.base_url {
            builder.base_url(base_url)
        } else {
            builder
        };
        let client = builder.build().map_err(ChatError::from)?;
        let model = client.completion_model(llm.model.clone());

        Ok(Self {
            model,
            temperature: llm.temperature,
            seed_chars: title.seed_chars,
            cleaner: TitleCleaner::new(title.max_chars)?,
        })
    }
}

impl TitleGenerator for OllamaTitleGenerator {
    fn generate(
        &self,
        conversation_id: ConversationId,
        seed: String,
    ) -> TitleFuture<'_, ChatResult<String>> {
        Box::pin(async move {
            let request = self
                .model
                .completion_request(build_title_prompt(&seed, self.seed_chars))
                .preamble(TITLE_SYSTEM_PROMPT.to_string())
                .temperature(self.temperature)
                .build();

            let response = self.model.completion(request).await?;
            let title = self.cleaner.clean(&extract_text(&response.choice));
            if title.is_empty() {
                return Err(ChatError::Title("model returned an empty title".to_string()));
            }

            debug!(%conversation_id, %title, "Generated title");
            Ok(title)
        })
    }
}

fn extract_text(choice: &rig::OneOrMany<AssistantContent>) -> String {
    let mut out = String::new();
    for content in choice.iter() {
        if let AssistantContent::Text(text) = content {
            out.push_str(&text.text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> TitleCleaner {
        TitleCleaner::new(50).unwrap()
    }

    #[test]
    fn test_clean_strips_decoration() {
        assert_eq!(cleaner().clean("  \"**Weekend Trip Ideas**\"  "), "Weekend Trip Ideas");
        assert_eq!(cleaner().clean("Title: Rust borrow checker."), "Rust borrow checker");
    }

    #[test]
    fn test_clean_uses_first_line_and_collapses_spaces() {
        assert_eq!(
            cleaner().clean("\n\nPasta   recipe\tquestions\nSecond line"),
            "Pasta recipe questions"
        );
    }

    #[test]
    fn test_clean_truncates() {
        let title = TitleCleaner::new(10).unwrap().clean("A very long generated title");
        assert_eq!(title, "A very lon");
        assert!(title.chars().count() <= 10);
    }

    #[test]
    fn test_clean_empty() {
        assert_eq!(cleaner().clean("  \n \"\" "), "");
    }

    #[test]
    fn test_prompt_truncates_seed() {
        let seed = "x".repeat(500);
        let prompt = build_title_prompt(&seed, 200);
        assert!(prompt.contains(&"x".repeat(200)));
        assert!(!prompt.contains(&"x".repeat(201)));
    }
}
