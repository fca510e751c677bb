use crate::models::{
    chats::{Chat, ChatsError, Message, NewChat, NewMessage, NewStreamId, StreamId, Visibility},
    documents::{Document, DocumentError, NewDocument, NewSuggestion, Suggestion},
    users::{NewUser, User, UserError},
};
use chrono::{DateTime, Utc};
use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, Pool},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DBError {
    #[error("Database connection error")]
    ConnectionError,
    #[error("Chats error: {0}")]
    ChatsError(#[from] ChatsError),
    #[error("User error: {0}")]
    UserError(#[from] UserError),
    #[error("Document error: {0}")]
    DocumentError(#[from] DocumentError),
}

/// Storage operations used by the web layer.
///
/// Kept object-safe so the application can hold it as
/// `Arc<dyn DBConnection + Send + Sync>`.
pub trait DBConnection {
    // Users
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError>;
    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DBError>;

    // Chats
    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError>;
    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError>;
    fn update_chat_visibility(&self, id: Uuid, visibility: Visibility) -> Result<Chat, DBError>;
    fn delete_chat_by_id(&self, id: Uuid) -> Result<Chat, DBError>;

    // Messages
    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<(), DBError>;
    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError>;
    fn count_user_messages_since(&self, user_id: Uuid, since: DateTime<Utc>)
        -> Result<i64, DBError>;

    // Stream identifiers
    fn create_stream_id(&self, new_stream_id: NewStreamId) -> Result<StreamId, DBError>;
    fn get_stream_ids_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<StreamId>, DBError>;

    // Documents
    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError>;
    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError>;
    fn save_suggestions(&self, suggestions: Vec<NewSuggestion>)
        -> Result<Vec<Suggestion>, DBError>;
}

pub struct PostgresConnection {
    db: Pool<ConnectionManager<PgConnection>>,
}

impl PostgresConnection {
    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        self.db.get().map_err(|e| {
            tracing::error!("Failed to get pooled connection: {:?}", e);
            DBError::ConnectionError
        })
    }
}

impl DBConnection for PostgresConnection {
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError> {
        debug!("Creating user {}", new_user.id);
        let conn = &mut self.conn()?;
        new_user.insert(conn).map_err(DBError::from)
    }

    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError> {
        let conn = &mut self.conn()?;
        User::get_by_id(conn, id).map_err(DBError::from)
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DBError> {
        let conn = &mut self.conn()?;
        User::get_by_email(conn, email).map_err(DBError::from)
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        debug!("Creating chat {} for user {}", new_chat.id, new_chat.user_id);
        let conn = &mut self.conn()?;
        new_chat.insert(conn).map_err(DBError::from)
    }

    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError> {
        let conn = &mut self.conn()?;
        Chat::get_by_id(conn, id).map_err(DBError::from)
    }

    fn update_chat_visibility(&self, id: Uuid, visibility: Visibility) -> Result<Chat, DBError> {
        let conn = &mut self.conn()?;
        Chat::update_visibility(conn, id, visibility).map_err(DBError::from)
    }

    fn delete_chat_by_id(&self, id: Uuid) -> Result<Chat, DBError> {
        debug!("Deleting chat {}", id);
        let conn = &mut self.conn()?;
        Chat::delete_by_id(conn, id).map_err(DBError::from)
    }

    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<(), DBError> {
        if messages.is_empty() {
            return Ok(());
        }
        let conn = &mut self.conn()?;
        NewMessage::insert_batch(conn, &messages).map_err(DBError::from)
    }

    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError> {
        let conn = &mut self.conn()?;
        Message::get_by_chat_id(conn, chat_id).map_err(DBError::from)
    }

    fn count_user_messages_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, DBError> {
        let conn = &mut self.conn()?;
        Message::count_user_messages_since(conn, user_id, since).map_err(DBError::from)
    }

    fn create_stream_id(&self, new_stream_id: NewStreamId) -> Result<StreamId, DBError> {
        let conn = &mut self.conn()?;
        new_stream_id.insert(conn).map_err(DBError::from)
    }

    fn get_stream_ids_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<StreamId>, DBError> {
        let conn = &mut self.conn()?;
        StreamId::get_by_chat_id(conn, chat_id).map_err(DBError::from)
    }

    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError> {
        let conn = &mut self.conn()?;
        new_document.insert(conn).map_err(DBError::from)
    }

    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError> {
        let conn = &mut self.conn()?;
        Document::get_latest_by_id(conn, id).map_err(DBError::from)
    }

    fn save_suggestions(
        &self,
        suggestions: Vec<NewSuggestion>,
    ) -> Result<Vec<Suggestion>, DBError> {
        debug!("Saving {} suggestion(s)", suggestions.len());
        let conn = &mut self.conn()?;
        NewSuggestion::insert_all(conn, &suggestions).map_err(DBError::from)
    }
}

pub fn setup_db(url: &str) -> Result<Arc<dyn DBConnection + Send + Sync>, DBError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .max_size(10)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)
        .map_err(|e| {
            tracing::error!("Could not build connection pool: {:?}", e);
            DBError::ConnectionError
        })?;
    info!("Database connection pool established");
    Ok(Arc::new(PostgresConnection { db: pool }))
}
