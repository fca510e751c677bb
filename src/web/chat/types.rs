//! Typed message shapes shared by the chat routes, the reconciler and storage

use crate::models::chats::{Message, MessageRole, NewMessage, Visibility};
use crate::web::chat::errors::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

/// One tagged segment of a message.
///
/// Unknown `type` tags fail deserialization, which callers surface as a
/// validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    /// True for parts that carry something worth rendering.
    pub fn is_substantive(&self) -> bool {
        match self {
            MessagePart::Text { text } => !text.trim().is_empty(),
            MessagePart::ToolCall { .. } | MessagePart::ToolResult { .. } => true,
        }
    }

    pub fn parse_all(parts: Vec<Value>) -> Result<Vec<MessagePart>, ChatError> {
        parts
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                serde_json::from_value::<MessagePart>(raw)
                    .map_err(|e| ChatError::validation(format!("invalid part at index {}: {}", i, e)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Message as seen by the core and by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(id: Uuid, role: MessageRole, parts: Vec<MessagePart>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            parts,
            attachments: Vec::new(),
            created_at,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn to_new_message(&self, chat_id: Uuid) -> Result<NewMessage, ChatError> {
        let parts = serde_json::to_value(&self.parts)
            .map_err(|e| ChatError::validation(format!("unserializable parts: {}", e)))?;
        let attachments = serde_json::to_value(&self.attachments)
            .map_err(|e| ChatError::validation(format!("unserializable attachments: {}", e)))?;
        Ok(NewMessage {
            id: self.id,
            chat_id,
            role: self.role,
            parts,
            attachments,
            created_at: self.created_at,
        })
    }
}

impl TryFrom<Message> for ChatMessage {
    type Error = ChatError;

    fn try_from(row: Message) -> Result<Self, Self::Error> {
        let raw_parts: Vec<Value> = serde_json::from_value(row.parts).map_err(|e| {
            ChatError::validation(format!("message {} has malformed parts: {}", row.id, e))
        })?;
        let parts = MessagePart::parse_all(raw_parts)?;
        let attachments: Vec<Attachment> = if row.attachments.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(row.attachments).map_err(|e| {
                ChatError::validation(format!("message {} has malformed attachments: {}", row.id, e))
            })?
        };
        Ok(ChatMessage {
            id: row.id,
            role: row.role,
            parts,
            attachments,
            created_at: row.created_at,
        })
    }
}

/// Converts persisted rows, failing on the first malformed one.
pub fn messages_from_rows(rows: Vec<Message>) -> Result<Vec<ChatMessage>, ChatError> {
    rows.into_iter().map(ChatMessage::try_from).collect()
}

/// The new user message as submitted by a client. Every field is optional
/// at the wire level so that missing ids or parts surface as validation
/// errors rather than opaque body rejections.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub parts: Option<Vec<Value>>,
    #[serde(default, rename = "experimental_attachments", alias = "attachments")]
    pub attachments: Option<Vec<Attachment>>,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PostRequestBody {
    pub id: Uuid,
    pub message: UserMessageInput,
    #[validate(length(min = 1, max = 64))]
    pub selected_chat_model: String,
    pub selected_visibility_type: Visibility,
    #[serde(default)]
    pub search_enabled: bool,
}
