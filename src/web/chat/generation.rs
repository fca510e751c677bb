//! Multi-step generation loop
//!
//! Drives the provider for up to [`MAX_STEPS`] round-trips, executing tool
//! calls between steps, and fans every data stream part out to the storage
//! and client channels.

use crate::models::chats::MessageRole;
use crate::provider::{CompletionChunk, CompletionProvider, CompletionRequest};
use crate::web::chat::constants::{is_reasoning_model, FINISH_REASON_STOP, MAX_STEPS};
use crate::web::chat::conversions::MessageContentConverter;
use crate::web::chat::events::{DataStreamPart, Usage};
use crate::web::chat::tools::{execute_tool, tool_definitions, ToolContext};
use crate::web::chat::types::{ChatMessage, MessagePart};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Inputs for one generation.
pub struct GenerationJob {
    pub chat_id: Uuid,
    /// Model input, ending with the new user message.
    pub history: Vec<ChatMessage>,
    pub selected_chat_model: String,
    pub system_prompt: String,
    pub provider_model: String,
    pub search_enabled: bool,
    pub provider: Arc<dyn CompletionProvider>,
    pub tools: ToolContext,
    pub active_tools: &'static [&'static str],
}

#[derive(Debug)]
pub enum GenerationError {
    StorageClosed,
    ClientClosed,
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::StorageClosed => write!(f, "Storage channel closed"),
            GenerationError::ClientClosed => write!(f, "Client disconnected"),
        }
    }
}

impl std::error::Error for GenerationError {}

/// Fans parts out to storage and client.
pub struct PartEmitter {
    tx_storage: Option<mpsc::Sender<DataStreamPart>>,
    tx_client: mpsc::Sender<DataStreamPart>,
    client_alive: AtomicBool,
}

impl PartEmitter {
    pub fn new(
        tx_storage: mpsc::Sender<DataStreamPart>,
        tx_client: mpsc::Sender<DataStreamPart>,
    ) -> Self {
        Self {
            tx_storage: Some(tx_storage),
            tx_client,
            client_alive: AtomicBool::new(true),
        }
    }

    /// Unpersisted generation; stops once the client goes away.
    pub fn client_only(tx_client: mpsc::Sender<DataStreamPart>) -> Self {
        Self {
            tx_storage: None,
            tx_client,
            client_alive: AtomicBool::new(true),
        }
    }

    /// Storage delivery must succeed. Client delivery never waits: once the
    /// client channel is closed or full, the client is dropped and the
    /// generation carries on for storage alone.
    pub async fn emit(&self, part: DataStreamPart) -> Result<(), GenerationError> {
        let Some(tx_storage) = &self.tx_storage else {
            return self
                .tx_client
                .send(part)
                .await
                .map_err(|_| GenerationError::ClientClosed);
        };
        tx_storage
            .send(part.clone())
            .await
            .map_err(|_| GenerationError::StorageClosed)?;
        self.send_to_client(part);
        Ok(())
    }

    /// Storage records the failure; the client only sees generic text.
    pub async fn emit_error(&self, detail: String) {
        let Some(tx_storage) = &self.tx_storage else {
            let _ = self.tx_client.send(DataStreamPart::generic_error()).await;
            return;
        };
        let _ = tx_storage
            .send(DataStreamPart::Error { error_text: detail })
            .await;
        self.send_to_client(DataStreamPart::generic_error());
    }

    fn send_to_client(&self, part: DataStreamPart) {
        if !self.client_alive.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.tx_client.try_send(part) {
            debug!("Client stopped receiving ({}), continuing for storage only", e);
            self.client_alive.store(false, Ordering::Relaxed);
        }
    }
}

/// Runs the generation to completion regardless of client presence.
pub async fn run_generation(job: GenerationJob, emitter: PartEmitter) {
    let chat_id = job.chat_id;
    info!("Starting generation for chat {}", chat_id);
    if let Err(e) = generate(job, &emitter).await {
        error!("Generation for chat {} aborted: {}", chat_id, e);
    }
}

async fn generate(job: GenerationJob, emitter: &PartEmitter) -> Result<(), GenerationError> {
    let system = job.system_prompt.as_str();
    let tools = if is_reasoning_model(&job.selected_chat_model) {
        Vec::new()
    } else {
        tool_definitions(job.active_tools)
    };

    // Working copy of this turn, fed back to the model between steps.
    let mut turn_assistant = ChatMessage::new(Uuid::new_v4(), MessageRole::Assistant, vec![], Utc::now());
    let mut turn_tools: Vec<ChatMessage> = Vec::new();
    let mut usage = Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
    };
    let mut finish_reason = FINISH_REASON_STOP.to_string();

    for step in 0..MAX_STEPS {
        let mut context = job.history.clone();
        if !turn_assistant.parts.is_empty() {
            context.push(turn_assistant.clone());
            context.extend(turn_tools.iter().cloned());
        }

        let request = CompletionRequest {
            model: job.provider_model.clone(),
            messages: MessageContentConverter::to_provider_messages(system, &context),
            tools: tools.clone(),
            web_search: job.search_enabled,
        };

        debug!("Chat {} step {} requesting completion", job.chat_id, step + 1);
        let mut rx = match job.provider.stream_completion(request).await {
            Ok(rx) => rx,
            Err(e) => {
                emitter.emit_error(e.to_string()).await;
                return Ok(());
            }
        };

        let mut calls: Vec<(String, String, Value)> = Vec::new();
        let mut step_finish = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                CompletionChunk::TextDelta(delta) => {
                    trace!("Chat {} text delta: {} chars", job.chat_id, delta.len());
                    push_text(&mut turn_assistant, &delta);
                    emitter.emit(DataStreamPart::TextDelta { delta }).await?;
                }
                CompletionChunk::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    turn_assistant.parts.push(MessagePart::ToolCall {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        args: arguments.clone(),
                    });
                    emitter
                        .emit(DataStreamPart::ToolCall {
                            tool_call_id: id.clone(),
                            tool_name: name.clone(),
                            args: arguments.clone(),
                        })
                        .await?;
                    calls.push((id, name, arguments));
                }
                CompletionChunk::Usage {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    usage.prompt_tokens += prompt_tokens;
                    usage.completion_tokens += completion_tokens;
                }
                CompletionChunk::Done { finish_reason } => {
                    step_finish = Some(finish_reason);
                    break;
                }
                CompletionChunk::Error(e) => {
                    emitter.emit_error(e).await;
                    return Ok(());
                }
            }
        }

        let Some(reason) = step_finish else {
            warn!("Upstream closed without finishing step {}", step + 1);
            emitter.emit_error("upstream closed mid-step".to_string()).await;
            return Ok(());
        };

        for (id, name, arguments) in &calls {
            let outcome = if job.active_tools.contains(&name.as_str()) {
                execute_tool(&job.tools, name, arguments).await
            } else {
                Err(format!("Tool {} is not available", name))
            };
            let result = match outcome {
                Ok(value) => value,
                Err(e) => {
                    warn!("Tool {} failed: {}", name, e);
                    json!({ "error": e })
                }
            };
            turn_tools.push(ChatMessage::new(
                Uuid::new_v4(),
                MessageRole::Tool,
                vec![MessagePart::ToolResult {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    result: result.clone(),
                }],
                Utc::now(),
            ));
            emitter
                .emit(DataStreamPart::ToolResult {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    result,
                })
                .await?;
        }

        emitter
            .emit(DataStreamPart::FinishStep {
                finish_reason: reason.clone(),
            })
            .await?;
        finish_reason = reason;

        if calls.is_empty() {
            break;
        }
        if step + 1 == MAX_STEPS {
            info!("Chat {} reached the step limit", job.chat_id);
        }
    }

    emitter
        .emit(DataStreamPart::Finish {
            finish_reason,
            usage: Some(usage),
        })
        .await?;
    Ok(())
}

fn push_text(message: &mut ChatMessage, delta: &str) {
    if let Some(MessagePart::Text { text }) = message.parts.last_mut() {
        text.push_str(delta);
    } else {
        message.parts.push(MessagePart::text(delta));
    }
}
