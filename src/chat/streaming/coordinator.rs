//! Streaming append coordinator.
//!
//! Turns an incremental assistant response into exactly one persisted message:
//! the user message is written before the request goes out, fragments are
//! accumulated in arrival order, and the assistant message is written only once
//! the transport completes. Errors and cancellation leave nothing behind for
//! the assistant side of the turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::ConversationId;
use crate::chat::core::role::Role;
use crate::chat::storage::conversation_store::ConversationStore;
use crate::chat::streaming::events::{TurnEvent, TurnEventSender, TurnOutcome, TurnRequest};
use crate::chat::streaming::transport::{AssistantTransport, Fragment, FragmentStream};
use crate::chat::title::title_generator::TitleGenerator;

/// Cancellation handle of one in-flight turn.
#[derive(Debug, Default)]
struct TurnHandle {
    cancelled: AtomicBool,
    notify: Notify,
}

impl TurnHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Unregisters a turn when `submit` returns or its future is dropped.
struct ActiveTurnGuard<'a> {
    turns: &'a DashMap<ConversationId, Arc<TurnHandle>>,
    conversation_id: ConversationId,
    handle: Arc<TurnHandle>,
}

impl ActiveTurnGuard<'_> {
    /// Unregister now. Waits for any `cancel` that already found the handle.
    fn release(&self) {
        self.turns.remove_if(&self.conversation_id, |_, current| {
            Arc::ptr_eq(current, &self.handle)
        });
    }
}

impl Drop for ActiveTurnGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bridge between an assistant transport and the conversation store.
///
/// At most one active stream per conversation is assumed; preventing a second
/// submission while one is streaming is up to the caller.
pub struct StreamingAppendCoordinator {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn AssistantTransport>,
    titles: Option<Arc<dyn TitleGenerator>>,
    active: DashMap<ConversationId, Arc<TurnHandle>>,
}

impl StreamingAppendCoordinator {
    /// Create a coordinator without title generation.
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, transport: Arc<dyn AssistantTransport>) -> Self {
        Self {
            store,
            transport,
            titles: None,
            active: DashMap::new(),
        }
    }

    /// Generate titles for new conversations with `titles`.
    #[must_use]
    pub fn with_title_generator(mut self, titles: Arc<dyn TitleGenerator>) -> Self {
        self.titles = Some(titles);
        self
    }

    /// Store the coordinator writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Whether a turn is currently streaming for `conversation_id`.
    #[must_use]
    pub fn is_streaming(&self, conversation_id: ConversationId) -> bool {
        self.active.contains_key(&conversation_id)
    }

    /// Cancel the active turn of `conversation_id`.
    ///
    /// Returns `false` if no turn was streaming, including once the reply is
    /// being written. A cancelled turn stops consuming fragments and never
    /// writes an assistant message.
    pub fn cancel(&self, conversation_id: ConversationId) -> bool {
        match self.active.get(&conversation_id) {
            Some(handle) => {
                handle.cancel();
                info!(%conversation_id, "Cancelling turn");
                true
            }
            None => false,
        }
    }

    /// Run one turn: persist the user message, stream the reply, persist it.
    ///
    /// Live progress is sent to `events` when given. Dropping the receiver,
    /// calling [`Self::cancel`] or dropping this future cancels the turn.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank content, a storage error if a write
    /// fails (including an unknown conversation) and a transport error if the
    /// assistant endpoint fails. After a transport error the user message stays
    /// persisted.
    pub async fn submit(
        &self,
        request: TurnRequest,
        events: Option<TurnEventSender>,
    ) -> ChatResult<TurnOutcome> {
        if request.content.trim().is_empty() {
            return Err(ChatError::InvalidInput(
                "message content must not be empty".to_string(),
            ));
        }

        let (user_message, is_new) = match request.conversation_id {
            Some(id) => (
                self.store
                    .append_message(id, &request.content, Role::User)
                    .await?,
                false,
            ),
            None => (
                self.store
                    .create_conversation_with_message(None, &request.content, Role::User)
                    .await?,
                true,
            ),
        };
        let conversation_id = user_message.conversation_id;
        emit(
            events.as_ref(),
            TurnEvent::UserPersisted {
                message: user_message.clone(),
            },
        );

        let handle = Arc::new(TurnHandle::default());
        if self
            .active
            .insert(conversation_id, Arc::clone(&handle))
            .is_some()
        {
            warn!(%conversation_id, "Turn submitted while another was streaming");
        }
        let guard = ActiveTurnGuard {
            turns: &self.active,
            conversation_id,
            handle: Arc::clone(&handle),
        };

        let history = self.store.get_conversation(conversation_id).await?.messages;
        let opened = tokio::select! {
            biased;
            () = handle.notify.notified() => None,
            opened = self.transport.open_stream(conversation_id, history) => Some(opened),
        };
        let stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(err)) => {
                warn!(%conversation_id, %err, "Assistant request failed");
                return Err(err);
            }
            None => {
                info!(%conversation_id, "Turn cancelled before streaming");
                return Ok(TurnOutcome::Cancelled {
                    conversation_id,
                    user_message,
                });
            }
        };
        debug!(%conversation_id, "Streaming assistant reply");

        if is_new {
            self.spawn_title(conversation_id, request.content, events.clone());
        }

        let text = match accumulate(stream, &handle, events.as_ref()).await {
            Ok(Some(text)) if !handle.is_cancelled() => text,
            Ok(_) => {
                info!(%conversation_id, "Turn cancelled, assistant reply discarded");
                return Ok(TurnOutcome::Cancelled {
                    conversation_id,
                    user_message,
                });
            }
            Err(err) => {
                warn!(%conversation_id, %err, "Assistant stream failed");
                return Err(err);
            }
        };

        // From here on `cancel` reports no active turn.
        guard.release();
        if handle.is_cancelled() {
            info!(%conversation_id, "Turn cancelled before commit, assistant reply discarded");
            return Ok(TurnOutcome::Cancelled {
                conversation_id,
                user_message,
            });
        }

        let assistant_message = self
            .store
            .append_message(conversation_id, &text, Role::Assistant)
            .await?;
        emit(
            events.as_ref(),
            TurnEvent::AssistantPersisted {
                message: assistant_message.clone(),
            },
        );

        info!(
            %conversation_id,
            chars = assistant_message.content.chars().count(),
            "Turn completed"
        );
        Ok(TurnOutcome::Completed {
            conversation_id,
            user_message,
            assistant_message,
        })
    }

    fn spawn_title(
        &self,
        conversation_id: ConversationId,
        seed: String,
        events: Option<TurnEventSender>,
    ) {
        let Some(titles) = self.titles.clone() else {
            return;
        };
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let title = match titles.generate(conversation_id, seed).await {
                Ok(title) => title,
                Err(err) => {
                    warn!(%conversation_id, %err, "Title generation failed");
                    return;
                }
            };

            if let Err(err) = store.rename_conversation(conversation_id, &title).await {
                warn!(%conversation_id, %err, "Failed to save title");
                return;
            }

            emit(
                events.as_ref(),
                TurnEvent::TitleGenerated {
                    conversation_id,
                    title,
                },
            );
        });
    }
}

/// Drain `stream`, forwarding text fragments to `events`.
///
/// Returns `None` when the turn is cancelled or the subscriber goes away, and
/// the concatenated text once the stream completes.
async fn accumulate(
    mut stream: FragmentStream,
    handle: &TurnHandle,
    events: Option<&TurnEventSender>,
) -> ChatResult<Option<String>> {
    let subscriber_gone = async move {
        match events {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(subscriber_gone);

    let mut text = String::new();
    loop {
        if handle.is_cancelled() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            () = handle.notify.notified() => return Ok(None),
            () = &mut subscriber_gone => {
                debug!("Event subscriber dropped");
                return Ok(None);
            }
            next = stream.next() => match next {
                Some(Ok(Fragment::Text(chunk))) => {
                    text.push_str(&chunk);
                    emit(events, TurnEvent::Fragment { text: chunk });
                }
                Some(Ok(Fragment::Reasoning(_) | Fragment::Other)) => {}
                Some(Err(err)) => return Err(err),
                None => return Ok(Some(text)),
            },
        }
    }
}

fn emit(events: Option<&TurnEventSender>, event: TurnEvent) {
    if let Some(tx) = events {
        if tx.send(event).is_err() {
            debug!("Turn event dropped, subscriber gone");
        }
    }
}
