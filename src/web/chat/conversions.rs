//! Conversions from chat history to provider message format

use crate::models::chats::MessageRole;
use crate::web::chat::reconciler::ToolResultIndex;
use crate::web::chat::types::{Attachment, ChatMessage, MessagePart};
use serde_json::{json, Value};
use tracing::trace;

pub struct MessageContentConverter;

impl MessageContentConverter {
    /// Builds the provider message list for `history`.
    ///
    /// Each assistant tool call is immediately followed by its result. Calls
    /// that never received a result are left out of model input, and tool
    /// messages are not emitted on their own since their results are placed
    /// through the index.
    pub fn to_provider_messages(system_prompt: &str, history: &[ChatMessage]) -> Vec<Value> {
        let index = ToolResultIndex::build(history);
        let mut out = Vec::with_capacity(history.len() + 1);
        out.push(json!({"role": "system", "content": system_prompt}));

        for message in history {
            match message.role {
                MessageRole::User => out.push(Self::user_message(message)),
                MessageRole::System => out.push(json!({
                    "role": "system",
                    "content": message.text(),
                })),
                MessageRole::Assistant => Self::push_assistant(message, &index, &mut out),
                MessageRole::Tool => {}
            }
        }

        trace!("Converted {} message(s) for the provider", out.len());
        out
    }

    fn user_message(message: &ChatMessage) -> Value {
        let images: Vec<&Attachment> = message
            .attachments
            .iter()
            .filter(|a| {
                a.content_type
                    .as_deref()
                    .map(|t| t.starts_with("image/"))
                    .unwrap_or(false)
            })
            .collect();

        if images.is_empty() {
            return json!({"role": "user", "content": message.text()});
        }

        let mut content = vec![json!({"type": "text", "text": message.text()})];
        content.extend(
            images
                .into_iter()
                .map(|a| json!({"type": "image_url", "image_url": {"url": a.url}})),
        );
        json!({"role": "user", "content": content})
    }

    fn push_assistant(message: &ChatMessage, index: &ToolResultIndex<'_>, out: &mut Vec<Value>) {
        let text = message.text();
        let mut tool_calls = Vec::new();
        let mut results = Vec::new();

        for part in &message.parts {
            if let MessagePart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } = part
            {
                let Some(result) = index.get(tool_call_id) else {
                    continue;
                };
                tool_calls.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {"name": tool_name, "arguments": args.to_string()},
                }));
                results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": result.to_string(),
                }));
            }
        }

        if text.is_empty() && tool_calls.is_empty() {
            return;
        }

        let mut assistant = json!({"role": "assistant", "content": text});
        if !tool_calls.is_empty() {
            assistant["tool_calls"] = Value::Array(tool_calls);
        }
        out.push(assistant);
        out.extend(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(role: MessageRole, parts: Vec<MessagePart>) -> ChatMessage {
        ChatMessage::new(Uuid::new_v4(), role, parts, Utc::now())
    }

    #[test]
    fn test_tool_results_follow_their_calls() {
        let history = vec![
            message(MessageRole::User, vec![MessagePart::text("weather in Berlin?")]),
            message(
                MessageRole::Assistant,
                vec![
                    MessagePart::ToolCall {
                        tool_call_id: "call_1".to_string(),
                        tool_name: "getWeather".to_string(),
                        args: json!({"latitude": 52.5}),
                    },
                    MessagePart::text("It is mild."),
                ],
            ),
            message(
                MessageRole::Tool,
                vec![MessagePart::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    tool_name: "getWeather".to_string(),
                    result: json!({"temperature": 18}),
                }],
            ),
        ];

        let out = MessageContentConverter::to_provider_messages("sys", &history);
        let roles: Vec<&str> = out.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert_eq!(out[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(out[3]["tool_call_id"], "call_1");
        assert_eq!(out[2]["content"], "It is mild.");
    }

    #[test]
    fn test_unmatched_tool_call_is_left_out() {
        let history = vec![message(
            MessageRole::Assistant,
            vec![MessagePart::ToolCall {
                tool_call_id: "pending".to_string(),
                tool_name: "getWeather".to_string(),
                args: json!({}),
            }],
        )];
        let out = MessageContentConverter::to_provider_messages("sys", &history);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_image_attachments_become_content_parts() {
        let mut user = message(MessageRole::User, vec![MessagePart::text("what is this?")]);
        user.attachments.push(Attachment {
            url: "https://files.example/cat.png".to_string(),
            name: Some("cat.png".to_string()),
            content_type: Some("image/png".to_string()),
        });
        let out = MessageContentConverter::to_provider_messages("sys", &[user]);
        assert_eq!(out[1]["content"][1]["type"], "image_url");
        assert_eq!(out[1]["content"][1]["image_url"]["url"], "https://files.example/cat.png");
    }
}
