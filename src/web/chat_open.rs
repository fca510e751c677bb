//! Stateless chat endpoint: streams a completion for a client-held history
//! without persisting anything.

use crate::models::chats::MessageRole;
use crate::web::chat::constants::{
    CHAT_MODEL, CLIENT_CHANNEL_BUFFER, OPEN_CHAT_DEFAULT_MODEL, OPEN_CHAT_TOOLS,
};
use crate::web::chat::events::{to_sse_event, DataStreamPart};
use crate::web::chat::generation::{run_generation, GenerationJob, PartEmitter};
use crate::web::chat::prompts::REGULAR_PROMPT;
use crate::web::chat::tools::ToolContext;
use crate::web::chat::types::{ChatMessage, MessagePart};
use crate::{ApiError, AppState, ErrorType, Surface};
use axum::{
    extract::{rejection::JsonRejection, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use chrono::{Duration, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct OpenMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChatRequest {
    pub messages: Vec<OpenMessage>,
    #[serde(default)]
    pub model_id: Option<String>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/chat-open", post(stream_open_chat).get(ready))
        .with_state(app_state)
}

async fn ready() -> &'static str {
    "Ready"
}

/// Keeps user and assistant turns, dropping assistant placeholders with no
/// content. Timestamps only preserve the submitted order.
fn to_history(messages: Vec<OpenMessage>) -> Vec<ChatMessage> {
    let base = Utc::now();
    messages
        .into_iter()
        .filter(|m| match m.role {
            MessageRole::User => true,
            MessageRole::Assistant => !m.content.trim().is_empty(),
            MessageRole::System | MessageRole::Tool => false,
        })
        .enumerate()
        .map(|(i, m)| {
            ChatMessage::new(
                Uuid::new_v4(),
                m.role,
                vec![MessagePart::text(m.content)],
                base + Duration::milliseconds(i as i64),
            )
        })
        .collect()
}

async fn stream_open_chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OpenChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(body) = body.map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(e.body_text())
    })?;

    let history = to_history(body.messages);
    if history.is_empty() {
        return Err(ApiError::new(ErrorType::BadRequest, Surface::Api)
            .with_cause("At least one message is required."));
    }
    let provider_model = body
        .model_id
        .unwrap_or_else(|| OPEN_CHAT_DEFAULT_MODEL.to_string());
    let user_message_id = Uuid::new_v4();
    debug!(
        "Open chat with {} message(s) on {}",
        history.len(),
        provider_model
    );

    let (tx_client, rx_client) = mpsc::channel::<DataStreamPart>(CLIENT_CHANNEL_BUFFER);
    let job = GenerationJob {
        chat_id: Uuid::new_v4(),
        history,
        selected_chat_model: CHAT_MODEL.to_string(),
        system_prompt: REGULAR_PROMPT.to_string(),
        provider_model,
        search_enabled: false,
        provider: state.provider.clone(),
        tools: ToolContext {
            db: state.db.clone(),
            provider: state.provider.clone(),
            http: state.http.clone(),
            user_id: Uuid::nil(),
        },
        active_tools: OPEN_CHAT_TOOLS,
    };
    tokio::spawn(run_generation(job, PartEmitter::client_only(tx_client)));

    let first = DataStreamPart::user_message_id(user_message_id);
    let events = futures::stream::once(async move { first })
        .chain(ReceiverStream::new(rx_client))
        .map(|part| {
            trace!("Open chat part: {:?}", part);
            Ok(to_sse_event(part.encode()))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
