//! Storage task components for accumulating and persisting a generated turn

use crate::db::DBConnection;
use crate::models::chats::MessageRole;
use crate::web::chat::delivery::GenerationTicket;
use crate::web::chat::errors::ChatError;
use crate::web::chat::events::{DataStreamPart, Usage};
use crate::web::chat::reconciler::merge_assistant_turn;
use crate::web::chat::types::{ChatMessage, MessagePart};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Accumulates streamed parts into the messages of one turn.
pub(crate) struct ContentAccumulator {
    assistant_id: Uuid,
    parts: Vec<MessagePart>,
    tool_messages: Vec<ChatMessage>,
}

impl ContentAccumulator {
    pub fn new(assistant_id: Uuid) -> Self {
        Self {
            assistant_id,
            parts: Vec::new(),
            tool_messages: Vec::new(),
        }
    }

    /// Handle a streamed part and return the accumulator state
    pub fn handle_part(&mut self, part: DataStreamPart) -> AccumulatorState {
        match part {
            DataStreamPart::TextDelta { delta } => {
                trace!("Storage: received text delta: {} chars", delta.len());
                match self.parts.last_mut() {
                    Some(MessagePart::Text { text }) => text.push_str(&delta),
                    _ => self.parts.push(MessagePart::text(delta)),
                }
                AccumulatorState::Continue
            }
            DataStreamPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                self.parts.push(MessagePart::ToolCall {
                    tool_call_id,
                    tool_name,
                    args,
                });
                AccumulatorState::Continue
            }
            DataStreamPart::ToolResult {
                tool_call_id,
                tool_name,
                result,
            } => {
                self.tool_messages.push(ChatMessage::new(
                    Uuid::new_v4(),
                    MessageRole::Tool,
                    vec![MessagePart::ToolResult {
                        tool_call_id,
                        tool_name,
                        result,
                    }],
                    Utc::now(),
                ));
                AccumulatorState::Continue
            }
            DataStreamPart::FinishStep { finish_reason } => {
                trace!("Storage: step finished with {}", finish_reason);
                AccumulatorState::Continue
            }
            DataStreamPart::Data { .. } => AccumulatorState::Continue,
            DataStreamPart::Finish {
                finish_reason,
                usage,
            } => {
                debug!(
                    "Storage: received finish with reason={}, message_id={}",
                    finish_reason, self.assistant_id
                );
                AccumulatorState::Complete(CompleteData {
                    response: self.response_messages(),
                    finish_reason,
                    usage,
                })
            }
            DataStreamPart::Error { error_text } => {
                error!("Storage: received error: {}", error_text);
                AccumulatorState::Failed(FailureData {
                    error: error_text,
                    partial_parts: self.parts.len(),
                })
            }
        }
    }

    /// The generated messages in production order: tool results, then the
    /// assistant message. An assistant with no parts is left out.
    fn response_messages(&self) -> Vec<ChatMessage> {
        let mut response = self.tool_messages.clone();
        if !self.parts.is_empty() {
            response.push(ChatMessage::new(
                self.assistant_id,
                MessageRole::Assistant,
                self.parts.clone(),
                Utc::now(),
            ));
        }
        response
    }
}

/// State transitions for the accumulator
pub enum AccumulatorState {
    Continue,
    Complete(CompleteData),
    Failed(FailureData),
}

pub struct CompleteData {
    pub response: Vec<ChatMessage>,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

pub struct FailureData {
    pub error: String,
    pub partial_parts: usize,
}

/// Persists a completed turn through the reconciler.
pub(crate) struct TurnPersister {
    db: Arc<dyn DBConnection + Send + Sync>,
    chat_id: Uuid,
    user_message: ChatMessage,
}

impl TurnPersister {
    pub fn new(
        db: Arc<dyn DBConnection + Send + Sync>,
        chat_id: Uuid,
        user_message: ChatMessage,
    ) -> Self {
        Self {
            db,
            chat_id,
            user_message,
        }
    }

    pub fn persist_completed(&self, data: CompleteData) -> Result<(), ChatError> {
        let turn = merge_assistant_turn(&self.user_message, &data.response)?;
        let assistant_id = turn.assistant.id;
        let rows = turn
            .into_messages()
            .iter()
            .map(|m| m.to_new_message(self.chat_id))
            .collect::<Result<Vec<_>, _>>()?;
        let count = rows.len();
        self.db.save_messages(rows)?;

        if let Some(usage) = data.usage {
            debug!(
                "Turn used {} prompt and {} completion tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }
        info!(
            "Persisted assistant message {} ({} row(s), finish_reason={}) for chat {}",
            assistant_id, count, data.finish_reason, self.chat_id
        );
        Ok(())
    }
}

/// Consumes the storage channel until the turn completes or fails, then
/// persists it and releases the chat's generation ticket.
///
/// Persistence is best effort: failures are logged and never reach a client
/// that is already streaming.
pub(crate) async fn storage_task(
    mut rx: mpsc::Receiver<DataStreamPart>,
    mut accumulator: ContentAccumulator,
    persister: TurnPersister,
    ticket: GenerationTicket,
) {
    while let Some(part) = rx.recv().await {
        match accumulator.handle_part(part) {
            AccumulatorState::Continue => continue,
            AccumulatorState::Complete(data) => {
                if let Err(e) = persister.persist_completed(data) {
                    error!(
                        "Failed to persist assistant turn for chat {}: {}",
                        persister.chat_id, e
                    );
                }
                ticket.finish();
                return;
            }
            AccumulatorState::Failed(data) => {
                warn!(
                    "Generation for chat {} failed after {} part(s), turn not persisted: {}",
                    persister.chat_id, data.partial_parts, data.error
                );
                ticket.finish();
                return;
            }
        }
    }

    warn!(
        "Storage channel closed before completion for chat {}",
        persister.chat_id
    );
    ticket.finish();
}
