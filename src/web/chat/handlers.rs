//! HTTP handlers for the persisted chat routes

use crate::models::chats::{Chat, NewChat, Visibility};
use crate::provider::CompletionProvider;
use crate::resumable::ChunkStream;
use crate::web::auth::{attach_session, Session};
use crate::web::chat::constants::{
    provider_model_for, CHAT_MODEL, CHAT_MODEL_COOKIE, CHAT_TOOLS, CLIENT_CHANNEL_BUFFER,
    STORAGE_CHANNEL_BUFFER, TITLE_FALLBACK_CHARS,
};
use crate::web::chat::delivery::ResumeOutcome;
use crate::web::chat::errors::ChatError;
use crate::web::chat::events::{to_sse_event, DataStreamPart};
use crate::web::chat::generation::{run_generation, GenerationJob, PartEmitter};
use crate::web::chat::prompts::{build_title_request, system_prompt, RequestHints};
use crate::web::chat::reconciler::{to_client_view, to_model_input};
use crate::web::chat::storage::{storage_task, ContentAccumulator, TurnPersister};
use crate::web::chat::tools::ToolContext;
use crate::web::chat::types::{messages_from_rows, PostRequestBody};
use crate::{ApiError, AppState, ErrorType, Surface};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use validator::Validate;

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/chat",
            post(create_chat_message)
                .get(resume_stream)
                .delete(delete_chat),
        )
        .route("/api/chat/:id", get(get_chat).patch(update_visibility))
        .layer(from_fn_with_state(app_state.clone(), attach_session))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
    #[serde(rename = "type")]
    pub user_type: crate::models::users::UserType,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub user: SessionUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPageResponse {
    pub chat: Chat,
    pub messages: Vec<crate::web::chat::types::ChatMessage>,
    pub chat_model: String,
    pub is_readonly: bool,
    pub session: SessionView,
}

fn require_session(session: Option<Extension<Session>>) -> Result<Session, ApiError> {
    session
        .map(|Extension(s)| s)
        .ok_or_else(|| ChatError::Unauthorized.into())
}

fn parse_id(raw: Option<&str>) -> Result<Uuid, ApiError> {
    let raw = raw.ok_or_else(|| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause("Parameter id is required.")
    })?;
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause("Parameter id is not a valid id.")
    })
}

fn load_chat(state: &AppState, chat_id: Uuid) -> Result<Chat, ApiError> {
    state
        .db
        .get_chat_by_id(chat_id)?
        .ok_or_else(|| ChatError::NotFound(Surface::Chat).into())
}

fn sse_response(chunks: ChunkStream) -> Response {
    let events = chunks.map(|chunk| Ok::<Event, Infallible>(to_sse_event(chunk)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Title for a new chat, falling back to the start of the user's text when
/// the title model is unavailable.
async fn generate_title(provider: &dyn CompletionProvider, user_text: &str) -> String {
    let fallback = || user_text.chars().take(TITLE_FALLBACK_CHARS).collect::<String>();
    match provider.complete(build_title_request(user_text)).await {
        Ok(title) if !title.trim().is_empty() => title.trim().trim_matches('"').to_string(),
        Ok(_) => fallback(),
        Err(e) => {
            warn!("Title generation failed, using message text: {}", e);
            fallback()
        }
    }
}

async fn create_chat_message(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    headers: HeaderMap,
    body: Result<Json<PostRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| {
        debug!("Rejected chat body: {}", e.body_text());
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(e.body_text())
    })?;
    body.validate().map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(e.to_string())
    })?;

    let session = require_session(session)?;
    let now = Utc::now();
    state
        .entitlements
        .check_quota(state.db.as_ref(), session.user_id, session.user_type, now)?;

    let provider_model = provider_model_for(&body.selected_chat_model).ok_or_else(|| {
        ApiError::new(ErrorType::BadRequest, Surface::Api)
            .with_cause(format!("Unknown model: {}", body.selected_chat_model))
    })?;

    let chat_id = body.id;
    let existing = state.db.get_chat_by_id(chat_id)?;
    if let Some(chat) = &existing {
        if !chat.is_owned_by(session.user_id) {
            return Err(ChatError::Forbidden.into());
        }
    }

    let prior = match &existing {
        Some(_) => messages_from_rows(state.db.get_messages_by_chat_id(chat_id)?)?,
        None => Vec::new(),
    };
    let history = to_model_input(prior, body.message, now)?;
    let user_message = history
        .last()
        .cloned()
        .ok_or_else(|| ApiError::new(ErrorType::Internal, Surface::Chat))?;

    let ticket = state.delivery.begin(chat_id)?;

    if existing.is_none() {
        let title = generate_title(state.provider.as_ref(), &user_message.text()).await;
        state.db.create_chat(NewChat {
            id: chat_id,
            user_id: session.user_id,
            title,
            visibility: body.selected_visibility_type,
        })?;
        info!("Created chat {} for user {}", chat_id, session.user_id);
    }

    state
        .db
        .save_messages(vec![user_message.to_new_message(chat_id)?])?;
    let stream_id = state.delivery.mint_stream_id(chat_id)?;

    let (tx_storage, rx_storage) = mpsc::channel::<DataStreamPart>(STORAGE_CHANNEL_BUFFER);
    let (tx_client, rx_client) = mpsc::channel::<DataStreamPart>(CLIENT_CHANNEL_BUFFER);

    let job = GenerationJob {
        chat_id,
        history,
        selected_chat_model: body.selected_chat_model.clone(),
        system_prompt: system_prompt(
            &body.selected_chat_model,
            &RequestHints::from_headers(&headers),
        ),
        provider_model: provider_model.to_string(),
        search_enabled: body.search_enabled,
        provider: state.provider.clone(),
        tools: ToolContext {
            db: state.db.clone(),
            provider: state.provider.clone(),
            http: state.http.clone(),
            user_id: session.user_id,
        },
        active_tools: CHAT_TOOLS,
    };

    let persister = TurnPersister::new(state.db.clone(), chat_id, user_message);
    tokio::spawn(storage_task(
        rx_storage,
        ContentAccumulator::new(Uuid::new_v4()),
        persister,
        ticket,
    ));
    tokio::spawn(run_generation(job, PartEmitter::new(tx_storage, tx_client)));

    let source: ChunkStream = ReceiverStream::new(rx_client)
        .map(|part| {
            trace!("Client part: {:?}", part);
            part.encode()
        })
        .boxed();
    let chunks = state.delivery.deliver(stream_id, source).await;

    debug!("Streaming chat {} on stream {}", chat_id, stream_id);
    Ok(sse_response(chunks))
}

async fn resume_stream(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    Query(query): Query<ResumeQuery>,
) -> Result<Response, ApiError> {
    let requested_at = Utc::now();
    if !state.delivery.is_resumable() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let chat_id = parse_id(query.chat_id.as_deref())?;
    let session = require_session(session)?;
    let chat = load_chat(&state, chat_id)?;
    if !chat.is_readable_by(session.user_id) {
        return Err(ChatError::Forbidden.into());
    }

    match state.delivery.resume(chat_id, requested_at).await? {
        ResumeOutcome::Unavailable => Ok(StatusCode::NO_CONTENT.into_response()),
        ResumeOutcome::Live(stream) => Ok(sse_response(stream)),
        ResumeOutcome::Snapshot(message) => {
            let chunks: Vec<String> = DataStreamPart::append_message(&message)
                .map(|part| part.encode())
                .into_iter()
                .collect();
            Ok(sse_response(futures::stream::iter(chunks).boxed()))
        }
        ResumeOutcome::Empty => Ok(sse_response(futures::stream::empty::<String>().boxed())),
    }
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Chat>, ApiError> {
    let chat_id = parse_id(query.id.as_deref())?;
    let session = require_session(session)?;
    let chat = load_chat(&state, chat_id)?;
    if !chat.is_owned_by(session.user_id) {
        return Err(ChatError::Forbidden.into());
    }

    let deleted = state.db.delete_chat_by_id(chat_id).map_err(|e| {
        error!("Failed to delete chat {}: {:?}", chat_id, e);
        ApiError::from(e)
    })?;
    state.delivery.forget(chat_id);
    info!("Deleted chat {}", chat_id);
    Ok(Json(deleted))
}

fn chat_model_from_cookie(headers: &HeaderMap) -> String {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CHAT_MODEL_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| CHAT_MODEL.to_string())
}

fn path_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id).map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(e.body_text())
    })
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    headers: HeaderMap,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ChatPageResponse>, ApiError> {
    let chat_id = path_id(path)?;
    let chat = load_chat(&state, chat_id)?;
    let session = require_session(session)?;
    if !chat.is_readable_by(session.user_id) {
        return Err(ChatError::Forbidden.into());
    }

    let persisted = messages_from_rows(state.db.get_messages_by_chat_id(chat_id)?)?;
    let view = to_client_view(persisted, Some(session.user_id), chat.user_id);

    Ok(Json(ChatPageResponse {
        chat,
        messages: view.messages,
        chat_model: chat_model_from_cookie(&headers),
        is_readonly: view.is_readonly,
        session: SessionView {
            user: SessionUser {
                id: session.user_id,
                email: session.email,
                user_type: session.user_type,
            },
        },
    }))
}

async fn update_visibility(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<VisibilityRequest>, JsonRejection>,
) -> Result<Json<Chat>, ApiError> {
    let chat_id = path_id(path)?;
    let Json(body) = body.map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Api).with_cause(e.body_text())
    })?;
    let session = require_session(session)?;
    let chat = load_chat(&state, chat_id)?;
    if !chat.is_owned_by(session.user_id) {
        return Err(ChatError::Forbidden.into());
    }

    let updated = state.db.update_chat_visibility(chat_id, body.visibility)?;
    debug!("Chat {} visibility -> {:?}", chat_id, updated.visibility);
    Ok(Json(updated))
}
