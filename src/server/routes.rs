//! HTTP route handlers for the chat log API.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::types::{Conversation, ConversationWithMessages};
use crate::chat::streaming::{TurnEvent, TurnOutcome, TurnRequest};

use super::state::AppState;

/// Error half of every handler result.
type ApiError = (StatusCode, String);

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation)
                .patch(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/api/chat", post(chat_stream))
        .route("/api/chat/{id}", delete(cancel_chat))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chatlog",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn parse_id(raw: &str) -> Result<ConversationId, ApiError> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid conversation id: {raw}")))
}

fn api_error(err: ChatError) -> ApiError {
    let status = match &err {
        ChatError::NotFound { .. } => StatusCode::NOT_FOUND,
        ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(%err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Conversation as shown in the library list.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    /// Stored record.
    #[serde(flatten)]
    pub conversation: Conversation,
    /// Title, or the creation-date fallback label.
    pub display_title: String,
}

impl From<Conversation> for ConversationSummary {
    fn from(conversation: Conversation) -> Self {
        let display_title = conversation.display_title();
        Self {
            conversation,
            display_title,
        }
    }
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let conversations = state.store().list_conversations().await.map_err(api_error)?;
    Ok(Json(
        conversations
            .into_iter()
            .map(ConversationSummary::from)
            .collect(),
    ))
}

/// Create conversation request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateConversationRequest {
    /// Initial title.
    pub title: Option<String>,
    /// Caller-chosen id.
    pub id: Option<String>,
}

/// Create conversation response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    /// Id of the new conversation.
    pub id: ConversationId,
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = request.id.as_deref().map(parse_id).transpose()?;
    let id = state
        .store()
        .create_conversation(request.title.as_deref(), id)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessages>, ApiError> {
    let id = parse_id(&id)?;
    let conversation = state.store().get_conversation(id).await.map_err(api_error)?;
    Ok(Json(conversation))
}

/// Rename request.
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    /// New title.
    pub title: String,
}

async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let title = request.title.trim();
    if title.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Title must not be empty".to_string()));
    }
    state
        .store()
        .rename_conversation(id, title)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.coordinator.cancel(id);
    state.store().delete_conversation(id).await.map_err(|err| {
        error!(conversation_id = %id, %err, "Delete failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not delete the chat".to_string(),
        )
    })?;
    info!(conversation_id = %id, "Conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Chat turn request.
#[derive(Debug, Deserialize)]
pub struct ChatStreamRequest {
    /// Conversation to continue; omitted for a new chat.
    pub conversation_id: Option<String>,
    /// The user's message.
    pub message: String,
}

/// Payload of the terminal `done` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnDone {
    /// Conversation the turn belongs to.
    pub conversation_id: ConversationId,
    /// Stored assistant message.
    pub message_id: MessageId,
}

/// Payload of the terminal `cancelled` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnCancelled {
    /// Conversation the turn belongs to.
    pub conversation_id: ConversationId,
}

/// Payload of the terminal `error` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnFailed {
    /// Human-readable failure.
    pub message: String,
}

/// Run one turn and stream its events.
///
/// The final event follows the turn itself; a title still being generated
/// does not hold the stream open. Closing the connection drops the event
/// receiver, which cancels the turn.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatStreamRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message must not be empty".to_string()));
    }

    let turn = match request.conversation_id.as_deref() {
        Some(raw) => {
            let id = parse_id(raw)?;
            if !state.store().conversation_exists(id).await.map_err(api_error)? {
                return Err(api_error(ChatError::not_found(id)));
            }
            TurnRequest::follow_up(id, request.message)
        }
        None => TurnRequest::new_conversation(request.message),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Arc::clone(&state.coordinator);
    let task = tokio::spawn(async move { coordinator.submit(turn, Some(tx)).await });

    Ok(Sse::new(turn_stream(rx, task)).keep_alive(KeepAlive::default()))
}

struct TurnStream {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    task: Option<JoinHandle<ChatResult<TurnOutcome>>>,
    backlog: VecDeque<Event>,
}

enum Step {
    Event(TurnEvent),
    Finished(Result<ChatResult<TurnOutcome>, JoinError>),
}

/// Forward turn events until the turn task ends, then whatever it already
/// queued, then the final event.
fn turn_stream(
    events: mpsc::UnboundedReceiver<TurnEvent>,
    task: JoinHandle<ChatResult<TurnOutcome>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = TurnStream {
        events,
        task: Some(task),
        backlog: VecDeque::new(),
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.backlog.pop_front() {
                return Some((Ok::<_, Infallible>(event), state));
            }
            let task = state.task.as_mut()?;
            let step = tokio::select! {
                biased;
                Some(event) = state.events.recv() => Step::Event(event),
                joined = task => Step::Finished(joined),
            };
            match step {
                Step::Event(event) => return Some((Ok(turn_event(&event)), state)),
                Step::Finished(joined) => {
                    state.task = None;
                    while let Ok(event) = state.events.try_recv() {
                        state.backlog.push_back(turn_event(&event));
                    }
                    state.backlog.push_back(terminal_event(joined));
                }
            }
        }
    })
}

async fn cancel_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if state.coordinator.cancel(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("No active turn for {id}")))
    }
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()))
}

fn turn_event(event: &TurnEvent) -> Event {
    let name = match event {
        TurnEvent::UserPersisted { .. } => "user_persisted",
        TurnEvent::Fragment { .. } => "fragment",
        TurnEvent::AssistantPersisted { .. } => "assistant_persisted",
        TurnEvent::TitleGenerated { .. } => "title_generated",
    };
    json_event(name, event)
}

fn terminal_event(joined: Result<ChatResult<TurnOutcome>, JoinError>) -> Event {
    match joined {
        Ok(Ok(TurnOutcome::Completed {
            conversation_id,
            assistant_message,
            ..
        })) => json_event(
            "done",
            &TurnDone {
                conversation_id,
                message_id: assistant_message.id,
            },
        ),
        Ok(Ok(TurnOutcome::Cancelled {
            conversation_id, ..
        })) => json_event("cancelled", &TurnCancelled { conversation_id }),
        Ok(Err(err)) => json_event(
            "error",
            &TurnFailed {
                message: err.to_string(),
            },
        ),
        Err(err) => {
            error!(%err, "Turn task failed");
            json_event(
                "error",
                &TurnFailed {
                    message: "Turn task failed".to_string(),
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tokio::time::timeout;
    use tower::ServiceExt;

    use super::*;
    use crate::chat::core::config::ChatConfig;
    use crate::chat::core::role::Role;
    use crate::chat::core::types::Message;
    use crate::chat::storage::SqliteConversationStore;
    use crate::chat::streaming::{
        AssistantTransport, Fragment, FragmentStream, StreamingAppendCoordinator, TransportFuture,
    };
    use crate::chat::title::{TitleFuture, TitleGenerator};

    enum Reply {
        Texts(Vec<&'static str>),
        /// One fragment, then a dropped connection.
        Fail,
        /// One fragment, then nothing until cancelled.
        Hang,
    }

    struct CannedTransport(Reply);

    impl AssistantTransport for CannedTransport {
        fn open_stream(
            &self,
            _conversation_id: ConversationId,
            _history: Vec<Message>,
        ) -> TransportFuture<'_, ChatResult<FragmentStream>> {
            let partial = || -> ChatResult<Fragment> { Ok(Fragment::Text("par".to_string())) };
            let stream = match &self.0 {
                Reply::Texts(parts) => {
                    let items: Vec<ChatResult<Fragment>> = parts
                        .iter()
                        .map(|text| Ok(Fragment::Text((*text).to_string())))
                        .collect();
                    stream::iter(items).boxed()
                }
                Reply::Fail => stream::iter(vec![
                    partial(),
                    Err(ChatError::Transport("reset".to_string())),
                ])
                .boxed(),
                Reply::Hang => stream::iter(vec![partial()]).chain(stream::pending()).boxed(),
            };
            Box::pin(async move { Ok(stream) })
        }
    }

    /// Never finishes within a test run.
    struct SlowTitle;

    impl TitleGenerator for SlowTitle {
        fn generate(
            &self,
            _conversation_id: ConversationId,
            _seed: String,
        ) -> TitleFuture<'_, ChatResult<String>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("Late".to_string())
            })
        }
    }

    async fn app_with(reply: Reply, titles: Option<Arc<dyn TitleGenerator>>) -> (Router, Arc<AppState>) {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let mut coordinator =
            StreamingAppendCoordinator::new(Arc::new(store), Arc::new(CannedTransport(reply)));
        if let Some(titles) = titles {
            coordinator = coordinator.with_title_generator(titles);
        }
        let state = AppState::from_parts(Arc::new(coordinator), ChatConfig::default());
        (create_router(Arc::clone(&state)), state)
    }

    async fn app() -> (Router, Arc<AppState>) {
        app_with(Reply::Texts(vec!["Hel", "lo!"]), None).await
    }

    fn event_names(body: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(body)
            .lines()
            .filter_map(|line| line.strip_prefix("event:"))
            .map(|name| name.trim().to_string())
            .collect()
    }

    async fn wait_for_turn(state: &AppState, id: ConversationId) {
        for _ in 0..200 {
            if state.coordinator.is_streaming(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("turn for {id} never started");
    }

    /// Start a turn on an existing conversation and return the unread response.
    async fn start_turn(app: &Router, state: &AppState) -> (ConversationId, axum::response::Response) {
        let id = state.store().create_conversation(None, None).await.unwrap();
        let body = json!({"conversation_id": id.to_string(), "message": "Hi"});
        let request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        wait_for_turn(state, id).await;
        (id, response)
    }

    async fn read_events(response: axum::response::Response) -> Vec<String> {
        let bytes = timeout(Duration::from_secs(3), to_bytes(response.into_body(), usize::MAX))
            .await
            .expect("stream did not end")
            .unwrap();
        event_names(&bytes)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_conversation_crud() {
        let (app, _) = app().await;

        let (status, body) =
            send(&app, "POST", "/api/conversations", Some(json!({"title": "Trip"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: CreatedResponse = serde_json::from_slice(&body).unwrap();
        let uri = format!("/api/conversations/{}", created.id);

        let (status, body) = send(&app, "GET", "/api/conversations", None).await;
        assert_eq!(status, StatusCode::OK);
        let list: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list[0]["title"], "Trip");
        assert_eq!(list[0]["display_title"], "Trip");

        let (status, _) = send(&app, "PATCH", &uri, Some(json!({"title": "Paris"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let detail: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail["title"], "Paris");
        assert_eq!(detail["messages"], json!([]));

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_and_unknown_ids() {
        let (app, _) = app().await;
        let (status, _) = send(&app, "GET", "/api/conversations/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = format!("/api/conversations/{}", ConversationId::new());
        let (status, _) = send(&app, "PATCH", &unknown, Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &unknown, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_chat_stream_persists_turn() {
        let (app, state) = app().await;

        let (status, body) = send(&app, "POST", "/api/chat", Some(json!({"message": "Hi"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            event_names(&body),
            ["user_persisted", "fragment", "fragment", "assistant_persisted", "done"]
        );

        let conversations = state.store().list_conversations().await.unwrap();
        assert_eq!(conversations.len(), 1);
        let detail = state.store().get_conversation(conversations[0].id).await.unwrap();
        let stored: Vec<(Role, &str)> = detail
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(stored, [(Role::User, "Hi"), (Role::Assistant, "Hello!")]);
    }

    #[tokio::test]
    async fn test_chat_rejects_blank_and_unknown() {
        let (app, state) = app().await;
        let (status, _) = send(&app, "POST", "/api/chat", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = json!({"conversation_id": ConversationId::new().to_string(), "message": "Hi"});
        let (status, _) = send(&app, "POST", "/api/chat", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(state.store().list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_active_turn() {
        let (app, _) = app().await;
        let uri = format!("/api/chat/{}", ConversationId::new());
        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_stream_does_not_wait_for_title() {
        let (app, state) = app_with(Reply::Texts(vec!["Hel", "lo!"]), Some(Arc::new(SlowTitle))).await;

        let (status, body) = timeout(
            Duration::from_secs(3),
            send(&app, "POST", "/api/chat", Some(json!({"message": "Hi"}))),
        )
        .await
        .expect("stream did not end");

        assert_eq!(status, StatusCode::OK);
        let names = event_names(&body);
        assert_eq!(names.last().map(String::as_str), Some("done"));
        assert!(!names.iter().any(|name| name == "title_generated"));
        let conversations = state.store().list_conversations().await.unwrap();
        assert_eq!(conversations[0].title, None);
    }

    #[tokio::test]
    async fn test_failed_stream_ends_with_error_event() {
        let (app, state) = app_with(Reply::Fail, Some(Arc::new(SlowTitle))).await;

        let (status, body) = timeout(
            Duration::from_secs(3),
            send(&app, "POST", "/api/chat", Some(json!({"message": "Hi"}))),
        )
        .await
        .expect("stream did not end");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(event_names(&body), ["user_persisted", "fragment", "error"]);
        assert!(String::from_utf8_lossy(&body).contains("reset"));
        let conversations = state.store().list_conversations().await.unwrap();
        let detail = state.store().get_conversation(conversations[0].id).await.unwrap();
        assert_eq!(detail.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_route_stops_active_turn() {
        let (app, state) = app_with(Reply::Hang, None).await;
        let (id, response) = start_turn(&app, &state).await;

        let (status, _) = send(&app, "DELETE", &format!("/api/chat/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let names = read_events(response).await;
        assert_eq!(names.last().map(String::as_str), Some("cancelled"));
        assert!(!names.iter().any(|name| name == "assistant_persisted"));
        assert!(!state.coordinator.is_streaming(id));
        let detail = state.store().get_conversation(id).await.unwrap();
        assert_eq!(detail.messages.len(), 1);
        assert_eq!(detail.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_delete_conversation_cancels_active_turn() {
        let (app, state) = app_with(Reply::Hang, None).await;
        let (id, response) = start_turn(&app, &state).await;

        let uri = format!("/api/conversations/{id}");
        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let names = read_events(response).await;
        assert_eq!(names.last().map(String::as_str), Some("cancelled"));
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(state.store().list_conversations().await.unwrap().is_empty());
    }
}
