//! In-memory doubles for the database and the model provider.

use crate::config::{AppConfig, ResumableBackend};
use crate::db::{DBConnection, DBError};
use crate::models::chats::{
    Chat, ChatsError, Message, MessageRole, NewChat, NewMessage, NewStreamId, StreamId, Visibility,
};
use crate::models::documents::{Document, NewDocument, NewSuggestion, Suggestion};
use crate::models::users::{NewUser, User, UserError};
use crate::provider::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionStream, ProviderError,
};
use crate::web::chat::delivery::DeliveryController;
use crate::web::chat::entitlements::Entitlements;
use crate::AppState;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    chats: Vec<Chat>,
    messages: Vec<Message>,
    stream_ids: Vec<StreamId>,
    documents: Vec<Document>,
    suggestions: Vec<Suggestion>,
}

#[derive(Default)]
pub struct MemoryDb {
    tables: Mutex<Tables>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, DBError> {
        self.tables.lock().map_err(|_| DBError::ConnectionError)
    }

    pub fn chats_for(&self, user_id: Uuid) -> Vec<Uuid> {
        self.tables
            .lock()
            .map(|t| {
                t.chats
                    .iter()
                    .filter(|c| c.user_id == user_id)
                    .map(|c| c.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.tables
            .lock()
            .map(|t| t.documents.clone())
            .unwrap_or_default()
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.tables
            .lock()
            .map(|t| t.suggestions.clone())
            .unwrap_or_default()
    }
}

impl DBConnection for MemoryDb {
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError> {
        let mut tables = self.tables()?;
        if tables.users.iter().any(|u| u.email == new_user.email) {
            return Err(UserError::DuplicateEmail.into());
        }
        let user = User {
            id: new_user.id,
            email: new_user.email,
            password_hash: new_user.password_hash,
            user_type: new_user.user_type,
            created_at: Utc::now(),
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError> {
        self.tables()?
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| UserError::NotFound.into())
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DBError> {
        Ok(self
            .tables()?
            .users
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        let chat = Chat {
            id: new_chat.id,
            user_id: new_chat.user_id,
            title: new_chat.title,
            visibility: new_chat.visibility,
            created_at: Utc::now(),
        };
        self.tables()?.chats.push(chat.clone());
        Ok(chat)
    }

    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError> {
        Ok(self.tables()?.chats.iter().find(|c| c.id == id).cloned())
    }

    fn update_chat_visibility(&self, id: Uuid, visibility: Visibility) -> Result<Chat, DBError> {
        let mut tables = self.tables()?;
        let chat = tables
            .chats
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(ChatsError::ChatNotFound)?;
        chat.visibility = visibility;
        Ok(chat.clone())
    }

    fn delete_chat_by_id(&self, id: Uuid) -> Result<Chat, DBError> {
        let mut tables = self.tables()?;
        let index = tables
            .chats
            .iter()
            .position(|c| c.id == id)
            .ok_or(ChatsError::ChatNotFound)?;
        let chat = tables.chats.remove(index);
        tables.messages.retain(|m| m.chat_id != id);
        tables.stream_ids.retain(|s| s.chat_id != id);
        Ok(chat)
    }

    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<(), DBError> {
        let mut tables = self.tables()?;
        tables.messages.extend(messages.into_iter().map(|m| Message {
            id: m.id,
            chat_id: m.chat_id,
            role: m.role,
            parts: m.parts,
            attachments: m.attachments,
            created_at: m.created_at,
        }));
        Ok(())
    }

    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError> {
        let mut rows: Vec<Message> = self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    fn count_user_messages_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, DBError> {
        let tables = self.tables()?;
        let count = tables
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User && m.created_at > since)
            .filter(|m| {
                tables
                    .chats
                    .iter()
                    .any(|c| c.id == m.chat_id && c.user_id == user_id)
            })
            .count();
        Ok(count as i64)
    }

    fn create_stream_id(&self, new_stream_id: NewStreamId) -> Result<StreamId, DBError> {
        let stream = StreamId {
            id: new_stream_id.id,
            chat_id: new_stream_id.chat_id,
            created_at: Utc::now(),
        };
        self.tables()?.stream_ids.push(stream.clone());
        Ok(stream)
    }

    fn get_stream_ids_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<StreamId>, DBError> {
        let mut rows: Vec<StreamId> = self
            .tables()?
            .stream_ids
            .iter()
            .filter(|s| s.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.created_at);
        Ok(rows)
    }

    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError> {
        let document = Document {
            id: new_document.id,
            user_id: new_document.user_id,
            title: new_document.title,
            kind: new_document.kind,
            content: new_document.content,
            created_at: Utc::now(),
        };
        self.tables()?.documents.push(document.clone());
        Ok(document)
    }

    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError> {
        Ok(self
            .tables()?
            .documents
            .iter()
            .filter(|d| d.id == id)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    fn save_suggestions(
        &self,
        suggestions: Vec<NewSuggestion>,
    ) -> Result<Vec<Suggestion>, DBError> {
        let rows: Vec<Suggestion> = suggestions
            .into_iter()
            .map(|s| Suggestion {
                id: s.id,
                document_id: s.document_id,
                document_created_at: s.document_created_at,
                user_id: s.user_id,
                original_text: s.original_text,
                suggested_text: s.suggested_text,
                description: s.description,
                is_resolved: false,
                created_at: Utc::now(),
            })
            .collect();
        self.tables()?.suggestions.extend(rows.iter().cloned());
        Ok(rows)
    }
}

/// Scripted provider. Each streamed completion consumes the next step; once
/// the script runs out it answers with an empty `stop`.
#[derive(Default)]
pub struct FakeProvider {
    steps: Mutex<VecDeque<Vec<CompletionChunk>>>,
    completion: Option<String>,
    transcript: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeProvider {
    pub fn with_steps(steps: Vec<Vec<CompletionChunk>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            completion: Some("Weather chat".to_string()),
            ..Default::default()
        }
    }

    pub fn with_completion(text: &str) -> Self {
        Self {
            completion: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn with_transcript(text: &str) -> Self {
        Self {
            transcript: Some(text.to_string()),
            ..Default::default()
        }
    }

    /// Requests seen by `stream_completion`, in order.
    pub fn stream_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for FakeProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let step = self
            .steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front())
            .unwrap_or_else(|| {
                vec![CompletionChunk::Done {
                    finish_reason: "stop".to_string(),
                }]
            });
        let (tx, rx) = mpsc::channel(step.len().max(1));
        for chunk in step {
            let _ = tx.try_send(chunk);
        }
        Ok(rx)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String, ProviderError> {
        self.completion
            .clone()
            .ok_or_else(|| ProviderError::Status(503, "no completion scripted".to_string()))
    }

    async fn transcribe(
        &self,
        _file_name: String,
        _content_type: Option<String>,
        _audio: Bytes,
    ) -> Result<String, ProviderError> {
        self.transcript
            .clone()
            .ok_or_else(|| ProviderError::Status(503, "no transcript scripted".to_string()))
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        port: 0,
        database_url: String::new(),
        openai_api_base: "http://localhost:0".to_string(),
        openai_api_key: "test-key".to_string(),
        jwt_secret: "test-secret".to_string(),
        token_ttl_hours: 1,
        cors_origins: Vec::new(),
        resumable_backend: ResumableBackend::Disabled,
        max_messages_guest: 20,
        max_messages_regular: 100,
    }
}

pub fn test_state(db: Arc<MemoryDb>, provider: Arc<dyn CompletionProvider>) -> Arc<AppState> {
    test_state_with(db, provider, test_config(), None)
}

/// Like [`test_state`], with explicit configuration and, optionally, a
/// delivery controller that has a registry attached.
pub fn test_state_with(
    db: Arc<MemoryDb>,
    provider: Arc<dyn CompletionProvider>,
    config: AppConfig,
    delivery: Option<Arc<DeliveryController>>,
) -> Arc<AppState> {
    let db: Arc<dyn DBConnection + Send + Sync> = db;
    let delivery =
        delivery.unwrap_or_else(|| Arc::new(DeliveryController::new(db.clone(), None)));
    Arc::new(AppState {
        entitlements: Entitlements::from_config(&config),
        db,
        config,
        provider,
        delivery,
        http: reqwest::Client::new(),
    })
}
