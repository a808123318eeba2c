//! Assistant transport abstraction.
//!
//! The assistant endpoint is consumed, not implemented, here: a transport takes
//! the conversation history and yields an ordered stream of fragments that ends
//! once (completion) or errors once (failure).

use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;

use crate::chat::core::errors::ChatResult;
use crate::chat::core::ids::ConversationId;
use crate::chat::core::types::Message;

/// Boxed future type for transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Incremental response: fragments in arrival order, then end of stream.
pub type FragmentStream = BoxStream<'static, ChatResult<Fragment>>;

/// One incremental piece of an assistant response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Fragment {
    /// Visible text; concatenated into the persisted message.
    Text(String),
    /// Model reasoning; rendered live at most, never persisted.
    Reasoning(String),
    /// Any other part type the endpoint emits.
    Other,
}

/// Streaming assistant endpoint.
pub trait AssistantTransport: Send + Sync {
    /// Open a streaming request for the next assistant turn.
    ///
    /// `history` is the full persisted conversation in replay order, ending
    /// with the user message that triggered the turn.
    ///
    /// # Errors
    /// Returns `Transport` if the request cannot be issued.
    fn open_stream(
        &self,
        conversation_id: ConversationId,
        history: Vec<Message>,
    ) -> TransportFuture<'_, ChatResult<FragmentStream>>;
}
