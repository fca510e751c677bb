use crate::models::schema::{chats, messages, stream_ids};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChatsError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Chat not found")]
    ChatNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::Visibility"]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::MessageRole"]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

// ============================================================================
// Chats
// ============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chats)]
pub struct NewChat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub visibility: Visibility,
}

impl Chat {
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    /// Private chats are only readable by their owner.
    pub fn is_readable_by(&self, user_id: Uuid) -> bool {
        self.visibility == Visibility::Public || self.is_owned_by(user_id)
    }

    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Chat>, ChatsError> {
        chats::table
            .filter(chats::id.eq(id))
            .first::<Chat>(conn)
            .optional()
            .map_err(ChatsError::DatabaseError)
    }

    pub fn update_visibility(
        conn: &mut PgConnection,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Chat, ChatsError> {
        diesel::update(chats::table.filter(chats::id.eq(id)))
            .set(chats::visibility.eq(visibility))
            .get_result(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ChatsError::ChatNotFound,
                _ => ChatsError::DatabaseError(e),
            })
    }

    /// Deletes the chat; messages and stream ids go with it through the
    /// foreign key cascade.
    pub fn delete_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Chat, ChatsError> {
        diesel::delete(chats::table.filter(chats::id.eq(id)))
            .get_result(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ChatsError::ChatNotFound,
                _ => ChatsError::DatabaseError(e),
            })
    }
}

impl NewChat {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Chat, ChatsError> {
        diesel::insert_into(chats::table)
            .values(self)
            .get_result(conn)
            .map_err(ChatsError::DatabaseError)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Persisted message row. `parts` and `attachments` hold the JSON encoding of
/// the typed parts used by the chat module.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub parts: serde_json::Value,
    pub attachments: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub parts: serde_json::Value,
    pub attachments: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn get_by_chat_id(conn: &mut PgConnection, chat_id: Uuid) -> Result<Vec<Message>, ChatsError> {
        messages::table
            .filter(messages::chat_id.eq(chat_id))
            .order(messages::created_at.asc())
            .load::<Message>(conn)
            .map_err(ChatsError::DatabaseError)
    }

    /// Counts user-role messages in chats owned by `user_id` created strictly
    /// after `since`.
    pub fn count_user_messages_since(
        conn: &mut PgConnection,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, ChatsError> {
        messages::table
            .inner_join(chats::table)
            .filter(chats::user_id.eq(user_id))
            .filter(messages::role.eq(MessageRole::User))
            .filter(messages::created_at.gt(since))
            .count()
            .get_result::<i64>(conn)
            .map_err(ChatsError::DatabaseError)
    }
}

impl NewMessage {
    pub fn insert_batch(conn: &mut PgConnection, batch: &[NewMessage]) -> Result<(), ChatsError> {
        diesel::insert_into(messages::table)
            .values(batch)
            .execute(conn)
            .map(|_| ())
            .map_err(ChatsError::DatabaseError)
    }
}

// ============================================================================
// Stream identifiers
// ============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = stream_ids)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StreamId {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = stream_ids)]
pub struct NewStreamId {
    pub id: Uuid,
    pub chat_id: Uuid,
}

impl StreamId {
    /// Oldest first, so the resumable candidate is the last element.
    pub fn get_by_chat_id(conn: &mut PgConnection, chat_id: Uuid) -> Result<Vec<StreamId>, ChatsError> {
        stream_ids::table
            .filter(stream_ids::chat_id.eq(chat_id))
            .order(stream_ids::created_at.asc())
            .load::<StreamId>(conn)
            .map_err(ChatsError::DatabaseError)
    }
}

impl NewStreamId {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<StreamId, ChatsError> {
        diesel::insert_into(stream_ids::table)
            .values(self)
            .get_result(conn)
            .map_err(ChatsError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(visibility: Visibility, owner: Uuid) -> Chat {
        Chat {
            id: Uuid::new_v4(),
            user_id: owner,
            title: "Weather".to_string(),
            visibility,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_private_chat_readable_only_by_owner() {
        let owner = Uuid::new_v4();
        let chat = chat(Visibility::Private, owner);
        assert!(chat.is_readable_by(owner));
        assert!(!chat.is_readable_by(Uuid::new_v4()));
    }

    #[test]
    fn test_public_chat_readable_by_anyone() {
        let chat = chat(Visibility::Public, Uuid::new_v4());
        assert!(chat.is_readable_by(Uuid::new_v4()));
    }

    #[test]
    fn test_visibility_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Visibility::Private).unwrap(), "private");
        assert_eq!(serde_json::to_value(MessageRole::Tool).unwrap(), "tool");
    }
}
