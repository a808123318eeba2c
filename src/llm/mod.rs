//! LLM transports.

pub mod ollama_chat_stream;

pub use ollama_chat_stream::{ChatChunkDecoder, OllamaTransport, decode_chat_stream};
