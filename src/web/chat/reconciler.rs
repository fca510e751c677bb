//! Message reconciliation between persisted rows, client input and model output
//!
//! Three passes live here:
//! - [`to_model_input`] appends a validated user message to the ordered history
//! - [`merge_assistant_turn`] picks the canonical assistant turn out of the
//!   messages produced during one generation
//! - [`to_client_view`] filters persisted history for rendering and derives
//!   the readonly flag

use crate::models::chats::MessageRole;
use crate::web::chat::errors::ChatError;
use crate::web::chat::types::{ChatMessage, MessagePart, UserMessageInput};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// call-id -> tool result, built once per pass.
pub struct ToolResultIndex<'a> {
    results: HashMap<&'a str, &'a Value>,
}

impl<'a> ToolResultIndex<'a> {
    pub fn build(messages: &'a [ChatMessage]) -> Self {
        let mut results = HashMap::new();
        for message in messages {
            for part in &message.parts {
                if let MessagePart::ToolResult {
                    tool_call_id,
                    result,
                    ..
                } = part
                {
                    results.insert(tool_call_id.as_str(), result);
                }
            }
        }
        Self { results }
    }

    pub fn get(&self, call_id: &str) -> Option<&'a Value> {
        self.results.get(call_id).copied()
    }
}

/// Validates the incoming user message and appends it to `prior`.
///
/// History is kept in creation order. The new message is stamped no earlier
/// than the last persisted message so it always sorts last.
pub fn to_model_input(
    mut prior: Vec<ChatMessage>,
    incoming: UserMessageInput,
    received_at: DateTime<Utc>,
) -> Result<Vec<ChatMessage>, ChatError> {
    prior.sort_by_key(|m| m.created_at);
    let user_message = validate_user_message(incoming, prior.last(), received_at)?;

    if prior.iter().any(|m| m.id == user_message.id) {
        return Err(ChatError::validation(format!(
            "message {} already exists in this chat",
            user_message.id
        )));
    }

    prior.push(user_message);
    Ok(prior)
}

fn validate_user_message(
    incoming: UserMessageInput,
    last: Option<&ChatMessage>,
    received_at: DateTime<Utc>,
) -> Result<ChatMessage, ChatError> {
    let id = incoming
        .id
        .ok_or_else(|| ChatError::validation("message id is required"))?;

    if let Some(role) = incoming.role {
        if role != MessageRole::User {
            return Err(ChatError::validation("only user messages can be submitted"));
        }
    }

    let raw_parts = incoming
        .parts
        .ok_or_else(|| ChatError::validation("message parts are required"))?;
    if raw_parts.is_empty() {
        return Err(ChatError::validation("message parts must not be empty"));
    }

    let parts = MessagePart::parse_all(raw_parts)?;
    if parts.iter().any(|p| !matches!(p, MessagePart::Text { .. })) {
        return Err(ChatError::validation("user messages may only contain text parts"));
    }

    let created_at = match last {
        Some(prev) if prev.created_at >= received_at => prev.created_at + Duration::milliseconds(1),
        _ => received_at,
    };

    Ok(ChatMessage {
        id,
        role: MessageRole::User,
        parts,
        attachments: incoming.attachments.unwrap_or_default(),
        created_at,
    })
}

/// The durable result of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    /// Tool-role messages carrying results, in creation order, all preceding
    /// the assistant message.
    pub tool_messages: Vec<ChatMessage>,
    pub assistant: ChatMessage,
}

impl AssistantTurn {
    /// Messages in the order they should be persisted.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        let mut messages = self.tool_messages;
        messages.push(self.assistant);
        messages
    }
}

/// Selects the last assistant message in `response` as the canonical turn.
///
/// Tool results produced during the turn are kept as separate tool messages,
/// restricted to results whose call id appears in an assistant tool-call of
/// the same response. Timestamps are clamped so that
/// `user < tool messages < assistant`. The function is pure, so calling it
/// twice on the same input yields the same turn.
pub fn merge_assistant_turn(
    user_message: &ChatMessage,
    response: &[ChatMessage],
) -> Result<AssistantTurn, ChatError> {
    let assistant = response
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && m.id != user_message.id)
        .cloned()
        .ok_or(ChatError::NoAssistantMessage)?;

    let issued_calls: HashSet<&str> = response
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            MessagePart::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut tool_messages: Vec<ChatMessage> = response
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .filter_map(|m| {
            let parts: Vec<MessagePart> = m
                .parts
                .iter()
                .filter(|p| match p {
                    MessagePart::ToolResult { tool_call_id, .. } => {
                        let known = issued_calls.contains(tool_call_id.as_str());
                        if !known {
                            warn!("Dropping tool result for unknown call id {}", tool_call_id);
                        }
                        known
                    }
                    _ => false,
                })
                .cloned()
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(ChatMessage {
                    parts,
                    ..m.clone()
                })
            }
        })
        .collect();
    tool_messages.sort_by_key(|m| m.created_at);

    let mut assistant = assistant;
    let floor = user_message.created_at;
    let slots = tool_messages.len() as i64 + 1;
    if assistant.created_at <= floor + Duration::milliseconds(slots) {
        assistant.created_at = floor + Duration::milliseconds(slots);
    }
    let ceiling = assistant.created_at;
    let count = tool_messages.len() as i64;
    for (i, message) in tool_messages.iter_mut().enumerate() {
        let earliest = floor + Duration::milliseconds(i as i64 + 1);
        let latest = ceiling - Duration::milliseconds(count - i as i64);
        message.created_at = message.created_at.max(earliest).min(latest);
    }

    debug!(
        "Merged assistant turn {} with {} tool message(s)",
        assistant.id,
        tool_messages.len()
    );

    Ok(AssistantTurn {
        tool_messages,
        assistant,
    })
}

/// History as rendered for a viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    pub messages: Vec<ChatMessage>,
    pub is_readonly: bool,
}

/// Passes persisted history through, dropping assistant placeholders that
/// carry no text and no tool parts. Unmatched tool calls are kept.
pub fn to_client_view(
    persisted: Vec<ChatMessage>,
    viewer: Option<Uuid>,
    owner: Uuid,
) -> ClientView {
    let messages = persisted
        .into_iter()
        .filter(|m| m.role != MessageRole::Assistant || m.parts.iter().any(|p| p.is_substantive()))
        .collect();

    ClientView {
        messages,
        is_readonly: viewer != Some(owner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn text_message(role: MessageRole, text: &str, secs: i64) -> ChatMessage {
        ChatMessage::new(Uuid::new_v4(), role, vec![MessagePart::text(text)], at(secs))
    }

    fn incoming(text: &str) -> UserMessageInput {
        UserMessageInput {
            id: Some(Uuid::new_v4()),
            role: Some(MessageRole::User),
            parts: Some(vec![json!({"type": "text", "text": text})]),
            attachments: None,
        }
    }

    fn tool_call(id: &str) -> MessagePart {
        MessagePart::ToolCall {
            tool_call_id: id.to_string(),
            tool_name: "getWeather".to_string(),
            args: json!({"latitude": 52.52, "longitude": 13.41}),
        }
    }

    fn tool_result(id: &str) -> MessagePart {
        MessagePart::ToolResult {
            tool_call_id: id.to_string(),
            tool_name: "getWeather".to_string(),
            result: json!({"temperature": 21.0}),
        }
    }

    #[test]
    fn test_user_message_is_appended_last_without_reordering() {
        let history = vec![
            text_message(MessageRole::User, "first", 0),
            text_message(MessageRole::Assistant, "reply", 5),
            text_message(MessageRole::User, "second", 10),
            text_message(MessageRole::Assistant, "reply two", 15),
        ];
        let expected_ids: Vec<Uuid> = history.iter().map(|m| m.id).collect();
        let input = incoming("third");
        let new_id = input.id.unwrap();

        let sequence = to_model_input(history, input, at(20)).unwrap();
        let view = to_client_view(sequence, None, Uuid::new_v4());

        let last_user = view
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .unwrap();
        assert_eq!(last_user.id, new_id);
        assert_eq!(view.messages.last().unwrap().id, new_id);

        let ids: Vec<Uuid> = view.messages.iter().map(|m| m.id).collect();
        assert_eq!(&ids[..4], &expected_ids[..]);
        assert!(view
            .messages
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_user_message_stamped_after_skewed_history() {
        let history = vec![text_message(MessageRole::Assistant, "from the future", 100)];
        let sequence = to_model_input(history, incoming("hello"), at(50)).unwrap();
        assert!(sequence[1].created_at > sequence[0].created_at);
    }

    #[test]
    fn test_missing_id_is_validation_error() {
        let mut input = incoming("hello");
        input.id = None;
        let result = to_model_input(vec![], input, at(0));
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_missing_or_empty_parts_is_validation_error() {
        let mut input = incoming("hello");
        input.parts = None;
        assert!(matches!(
            to_model_input(vec![], input, at(0)),
            Err(ChatError::Validation(_))
        ));

        let mut input = incoming("hello");
        input.parts = Some(vec![]);
        assert!(matches!(
            to_model_input(vec![], input, at(0)),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_part_tag_rejected() {
        let mut input = incoming("hello");
        input.parts = Some(vec![json!({"type": "file", "url": "x"})]);
        assert!(matches!(
            to_model_input(vec![], input, at(0)),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_non_user_role_rejected() {
        let mut input = incoming("hello");
        input.role = Some(MessageRole::Assistant);
        assert!(matches!(
            to_model_input(vec![], input, at(0)),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_merge_is_idempotent_for_single_assistant() {
        let user = text_message(MessageRole::User, "hi", 0);
        let response = vec![text_message(MessageRole::Assistant, "hello there", 2)];

        let first = merge_assistant_turn(&user, &response).unwrap();
        let second = merge_assistant_turn(&user, &response).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.assistant.text(), "hello there");
        assert!(first.tool_messages.is_empty());
    }

    #[test]
    fn test_merge_fails_on_tool_only_response() {
        let user = text_message(MessageRole::User, "hi", 0);
        let tool = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Tool,
            vec![tool_result("call_1")],
            at(1),
        );
        let result = merge_assistant_turn(&user, &[tool]);
        assert!(matches!(result, Err(ChatError::NoAssistantMessage)));
    }

    #[test]
    fn test_merge_picks_last_assistant_and_orders_tool_messages_first() {
        let user = text_message(MessageRole::User, "weather?", 0);
        let assistant = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Assistant,
            vec![tool_call("call_1"), MessagePart::text("It is 21 degrees.")],
            at(1),
        );
        let tool = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Tool,
            vec![tool_result("call_1"), tool_result("call_stale")],
            at(3),
        );
        let earlier_draft = text_message(MessageRole::Assistant, "draft", 1);

        let turn =
            merge_assistant_turn(&user, &[earlier_draft, tool, assistant.clone()]).unwrap();
        assert_eq!(turn.assistant.id, assistant.id);
        assert_eq!(turn.tool_messages.len(), 1);
        assert_eq!(turn.tool_messages[0].parts, vec![tool_result("call_1")]);

        let persisted = turn.into_messages();
        assert_eq!(persisted.last().unwrap().role, MessageRole::Assistant);
        assert!(persisted[0].created_at > user.created_at);
        assert!(persisted[0].created_at < persisted[1].created_at);
    }

    #[test]
    fn test_client_view_drops_empty_assistant_placeholder() {
        let owner = Uuid::new_v4();
        let placeholder = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Assistant,
            vec![MessagePart::text("")],
            at(2),
        );
        let persisted = vec![text_message(MessageRole::User, "hi", 0), placeholder];
        let view = to_client_view(persisted, Some(owner), owner);
        assert_eq!(view.messages.len(), 1);
        assert!(!view.is_readonly);
    }

    #[test]
    fn test_client_view_keeps_unmatched_tool_call() {
        let assistant = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Assistant,
            vec![tool_call("call_pending")],
            at(1),
        );
        let view = to_client_view(vec![assistant.clone()], Some(Uuid::new_v4()), Uuid::new_v4());
        assert_eq!(view.messages, vec![assistant]);
        assert!(view.is_readonly);
    }

    #[test]
    fn test_tool_result_index_spans_messages() {
        let messages = vec![
            ChatMessage::new(Uuid::new_v4(), MessageRole::Assistant, vec![tool_call("a")], at(0)),
            ChatMessage::new(Uuid::new_v4(), MessageRole::Tool, vec![tool_result("a")], at(1)),
        ];
        let index = ToolResultIndex::build(&messages);
        assert_eq!(index.get("a").unwrap()["temperature"], 21.0);
        assert!(index.get("b").is_none());
    }
}
