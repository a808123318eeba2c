//! Ollama `/api/chat` streaming transport.
//!
//! Behaviour:
//! - `POST {base_url}/api/chat` with `stream: true` and the persisted history.
//! - The body is newline-delimited JSON; each line carries a `message` delta,
//!   the last one carries `"done": true`.
//! - `{"error": ...}` lines, non-2xx statuses and bodies that end before
//!   `done` are transport errors.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat::core::config::LlmConfig;
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::ConversationId;
use crate::chat::core::role::Role;
use crate::chat::core::types::Message;
use crate::chat::streaming::transport::{
    AssistantTransport, Fragment, FragmentStream, TransportFuture,
};

/// Keep the model loaded in memory between turns.
const KEEP_ALIVE: &str = "1h";

/// TCP connect timeout. Streams themselves are unbounded.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    keep_alive: &'a str,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

/// Map a stored role onto Ollama's chat roles. `data` messages are not sent.
const fn ollama_role(role: Role) -> Option<&'static str> {
    match role {
        Role::User => Some("user"),
        Role::Assistant => Some("assistant"),
        Role::System => Some("system"),
        Role::Data => None,
    }
}

fn history_to_messages(history: &[Message]) -> Vec<ChatMessage<'_>> {
    history
        .iter()
        .filter_map(|message| {
            ollama_role(message.role).map(|role| ChatMessage {
                role,
                content: &message.content,
            })
        })
        .collect()
}

/// Incremental decoder for Ollama's NDJSON chat stream.
#[derive(Debug, Default)]
pub struct ChatChunkDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl ChatChunkDecoder {
    /// Feed raw body bytes; returns the fragments of every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ChatResult<Fragment>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Flush the trailing line at end of body.
    ///
    /// Reports an interrupted stream if `done` was never seen.
    pub fn finish(&mut self) -> Vec<ChatResult<Fragment>> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        self.decode_line(&rest, &mut out);
        if !self.done && !out.iter().any(Result::is_err) {
            out.push(Err(ChatError::Transport(
                "stream ended before completion".to_string(),
            )));
        }
        out
    }

    /// Whether the terminal `done` chunk has been decoded.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<ChatResult<Fragment>>) {
        let line = line.trim_ascii();
        if line.is_empty() || self.done {
            return;
        }

        let chunk: ChatChunk = match serde_json::from_slice(line) {
            Ok(chunk) => chunk,
            Err(err) => {
                out.push(Err(ChatError::Transport(format!("malformed chunk: {err}"))));
                return;
            }
        };

        if let Some(error) = chunk.error {
            out.push(Err(ChatError::Transport(error)));
            return;
        }
        if let Some(message) = chunk.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                out.push(Ok(Fragment::Reasoning(thinking)));
            }
            if !message.content.is_empty() {
                out.push(Ok(Fragment::Text(message.content)));
            }
        }
        self.done = chunk.done;
    }
}

struct BodyState<S> {
    body: Pin<Box<S>>,
    decoder: ChatChunkDecoder,
    pending: VecDeque<ChatResult<Fragment>>,
    finished: bool,
}

/// Turn a raw NDJSON body stream into a fragment stream.
pub fn decode_chat_stream<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = BodyState {
        body: Box::pin(body),
        decoder: ChatChunkDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let items = state.decoder.push(chunk.as_ref());
                    state.pending.extend(items);
                    state.finished = state.decoder.is_done();
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(ChatError::Transport(err.to_string())));
                }
                None => {
                    state.finished = true;
                    let items = state.decoder.finish();
                    state.pending.extend(items);
                }
            }
        }
    })
    .boxed()
}

/// Assistant transport backed by a local or remote Ollama server.
pub struct OllamaTransport {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaTransport {
    /// Create a transport for the configured model and endpoint.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> ChatResult<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.base_url_or_default(),
            model: config.model.clone(),
        })
    }
}

impl AssistantTransport for OllamaTransport {
    fn open_stream(
        &self,
        conversation_id: ConversationId,
        history: Vec<Message>,
    ) -> TransportFuture<'_, ChatResult<FragmentStream>> {
        Box::pin(async move {
            let request = ChatRequest {
                model: &self.model,
                messages: history_to_messages(&history),
                stream: true,
                keep_alive: KEEP_ALIVE,
            };

            let url = format!("{}/api/chat", self.base_url);
            let response = self.client.post(&url).json(&request).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::Transport(format!("HTTP {status}: {body}")));
            }

            debug!(%conversation_id, model = %self.model, "Opened Ollama chat stream");
            Ok(decode_chat_stream(response.bytes_stream()))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::chat::core::ids::MessageId;

    fn texts(items: &[ChatResult<Fragment>]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                Ok(Fragment::Text(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = ChatChunkDecoder::default();
        let mut items = decoder.push(br#"{"message":{"role":"assistant","content":"Hel"#);
        assert!(items.is_empty());
        items.extend(decoder.push(b"lo\"},\"done\":false}\n{\"message\":{\"content\":\" there\"},"));
        items.extend(decoder.push(b"\"done\":false}\n{\"done\":true}\n"));
        assert_eq!(texts(&items), ["Hello", " there"]);
        assert!(decoder.is_done());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_reports_interrupted_stream() {
        let mut decoder = ChatChunkDecoder::default();
        let items = decoder.push(b"{\"message\":{\"content\":\"partial\"},\"done\":false}\n");
        assert_eq!(texts(&items), ["partial"]);
        let tail = decoder.finish();
        assert!(matches!(tail.as_slice(), [Err(ChatError::Transport(_))]));
    }

    #[test]
    fn test_decoder_accepts_unterminated_final_line() {
        let mut decoder = ChatChunkDecoder::default();
        assert!(decoder.push(b"{\"done\":true}").is_empty());
        assert!(decoder.finish().is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_decoder_error_chunk() {
        let mut decoder = ChatChunkDecoder::default();
        let items = decoder.push(b"{\"error\":\"model not found\"}\n");
        match items.as_slice() {
            [Err(ChatError::Transport(msg))] => assert_eq!(msg, "model not found"),
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn test_decoder_reasoning_and_malformed() {
        let mut decoder = ChatChunkDecoder::default();
        let items = decoder.push(b"{\"message\":{\"content\":\"\",\"thinking\":\"hmm\"}}\nnot json\n");
        assert!(matches!(items[0], Ok(Fragment::Reasoning(ref t)) if t == "hmm"));
        assert!(matches!(items[1], Err(ChatError::Transport(_))));
    }

    #[tokio::test]
    async fn test_decode_chat_stream_end_to_end() {
        let body = stream::iter(vec![
            Ok::<_, String>(b"{\"message\":{\"content\":\"Hel".to_vec()),
            Ok(b"lo!\"}}\n{\"done\":true}\n".to_vec()),
        ]);
        let items: Vec<ChatResult<Fragment>> = decode_chat_stream(body).collect().await;
        assert_eq!(texts(&items), ["Hello!"]);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_decode_chat_stream_body_error() {
        let body = stream::iter(vec![
            Ok(b"{\"message\":{\"content\":\"a\"}}\n".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let items: Vec<ChatResult<Fragment>> = decode_chat_stream(body).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(ChatError::Transport(msg)) if msg == "connection reset"));
    }

    #[test]
    fn test_history_skips_data_messages() {
        let conversation_id = ConversationId::new();
        let message = |role, content: &str| Message {
            id: MessageId::new(),
            conversation_id,
            content: content.to_string(),
            role,
            sent_at: Utc::now(),
        };
        let history = vec![
            message(Role::System, "be brief"),
            message(Role::Data, "{\"k\":1}"),
            message(Role::User, "Hi"),
            message(Role::Assistant, "Hello!"),
        ];

        let messages = history_to_messages(&history);
        assert_eq!(
            messages,
            [
                ChatMessage { role: "system", content: "be brief" },
                ChatMessage { role: "user", content: "Hi" },
                ChatMessage { role: "assistant", content: "Hello!" },
            ]
        );
    }
}
