//! Data stream parts and their SSE encoding

use crate::web::chat::constants::{DATA_APPEND_MESSAGE, DATA_USER_MESSAGE_ID, STREAM_ERROR_TEXT};
use crate::web::chat::types::ChatMessage;
use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

/// One event on the chat data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DataStreamPart {
    TextDelta {
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
    },
    #[serde(rename = "step-finish", rename_all = "camelCase")]
    FinishStep {
        finish_reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Data {
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

impl DataStreamPart {
    /// Generic error part; internal detail never reaches the client.
    pub fn generic_error() -> Self {
        DataStreamPart::Error {
            error_text: STREAM_ERROR_TEXT.to_string(),
        }
    }

    /// Snapshot of a completed assistant message, replayed on resume.
    ///
    /// The message travels as a JSON string so clients can append it as-is.
    pub fn append_message(message: &ChatMessage) -> Option<Self> {
        match serde_json::to_string(message) {
            Ok(serialized) => Some(DataStreamPart::Data {
                data: json!([{"type": DATA_APPEND_MESSAGE, "message": serialized}]),
            }),
            Err(e) => {
                error!("Failed to serialize snapshot message {}: {:?}", message.id, e);
                None
            }
        }
    }

    pub fn user_message_id(id: Uuid) -> Self {
        DataStreamPart::Data {
            data: json!([{"type": DATA_USER_MESSAGE_ID, "content": id}]),
        }
    }

    /// JSON payload carried on the wire.
    pub fn encode(&self) -> String {
        match serde_json::to_string(self) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize data stream part: {:?}", e);
                // Serializing the fixed error part cannot fail
                format!(r#"{{"type":"error","errorText":"{}"}}"#, STREAM_ERROR_TEXT)
            }
        }
    }
}

/// Wraps an encoded part in an SSE event.
pub fn to_sse_event(payload: String) -> Event {
    Event::default().data(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chats::MessageRole;
    use crate::web::chat::types::MessagePart;
    use chrono::Utc;

    #[test]
    fn test_wire_tags() {
        let delta: Value = serde_json::from_str(
            &DataStreamPart::TextDelta {
                delta: "Hel".to_string(),
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(delta["type"], "text-delta");
        assert_eq!(delta["delta"], "Hel");

        let step: Value = serde_json::from_str(
            &DataStreamPart::FinishStep {
                finish_reason: "tool-calls".to_string(),
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(step["type"], "step-finish");
        assert_eq!(step["finishReason"], "tool-calls");

        let err: Value = serde_json::from_str(&DataStreamPart::generic_error().encode()).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["errorText"], STREAM_ERROR_TEXT);
    }

    #[test]
    fn test_append_message_carries_stringified_message() {
        let message = ChatMessage::new(
            Uuid::new_v4(),
            MessageRole::Assistant,
            vec![MessagePart::text("done")],
            Utc::now(),
        );
        let part = DataStreamPart::append_message(&message).unwrap();
        let DataStreamPart::Data { data } = part else {
            panic!("expected data part");
        };
        assert_eq!(data[0]["type"], "append-message");
        let restored: ChatMessage =
            serde_json::from_str(data[0]["message"].as_str().unwrap()).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn test_encoded_parts_decode_back() {
        let part = DataStreamPart::Finish {
            finish_reason: "stop".to_string(),
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 7,
            }),
        };
        let decoded: DataStreamPart = serde_json::from_str(&part.encode()).unwrap();
        assert_eq!(decoded, part);
    }
}
