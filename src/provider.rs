//! OpenAI-compatible completion provider
//!
//! Streams chat completions over SSE, folds tool-call argument fragments
//! into whole calls, and exposes plain completions and audio transcription
//! for the auxiliary routes.

use crate::web::chat::constants::{FINISH_REASON_STOP, UPSTREAM_CHUNK_TIMEOUT};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

const STREAM_CHANNEL_BUFFER: usize = 256;
const TRANSCRIPTION_MODEL: &str = "whisper-1";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream returned {0}: {1}")]
    Status(u16, String),
    #[error("Malformed upstream payload: {0}")]
    Parse(String),
    #[error("Upstream stream timed out")]
    Timeout,
}

/// One decoded increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Usage {
        prompt_tokens: i32,
        completion_tokens: i32,
    },
    Done {
        finish_reason: String,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    pub web_search: bool,
}

impl CompletionRequest {
    fn to_body(&self, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.clone());
            body["tool_choice"] = json!("auto");
        }
        if self.web_search {
            body["web_search_options"] = json!({"search_context_size": "high"});
        }
        body
    }
}

pub type CompletionStream = mpsc::Receiver<CompletionChunk>;

#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError>;

    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;

    async fn transcribe(
        &self,
        file_name: String,
        content_type: Option<String>,
        audio: Bytes,
    ) -> Result<String, ProviderError>;
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_base, endpoint)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("Upstream request failed with status {}: {}", status, body);
        Err(ProviderError::Status(status.as_u16(), body))
    }
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        debug!(
            "Streaming completion from model {} with {} message(s), {} tool(s)",
            request.model,
            request.messages.len(),
            request.tools.len()
        );
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request.to_body(true))
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_BUFFER);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = StreamDecoder::new();
            loop {
                match tokio::time::timeout(UPSTREAM_CHUNK_TIMEOUT, body.next()).await {
                    Ok(Some(Ok(bytes))) => {
                        let chunks = match decoder.push(&bytes) {
                            Ok(chunks) => chunks,
                            Err(e) => {
                                error!("Failed to decode upstream frame: {}", e);
                                let _ = tx.send(CompletionChunk::Error(e.to_string())).await;
                                return;
                            }
                        };
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                debug!("Completion consumer dropped, stopping upstream read");
                                return;
                            }
                        }
                        if decoder.is_finished() {
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        error!("Upstream stream error: {:?}", e);
                        let _ = tx.send(CompletionChunk::Error(e.to_string())).await;
                        return;
                    }
                    Ok(None) => {
                        for chunk in decoder.finish() {
                            let _ = tx.send(chunk).await;
                        }
                        return;
                    }
                    Err(_) => {
                        warn!("Upstream stream timed out");
                        let _ = tx
                            .send(CompletionChunk::Error(ProviderError::Timeout.to_string()))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request.to_body(false))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let json: Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse("completion has no message content".to_string()))
    }

    async fn transcribe(
        &self,
        file_name: String,
        content_type: Option<String>,
        audio: Bytes,
    ) -> Result<String, ProviderError> {
        let mut part = reqwest::multipart::Part::bytes(audio.to_vec()).file_name(file_name);
        if let Some(content_type) = content_type {
            part = part.mime_str(&content_type)?;
        }
        let form = reqwest::multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);

        let response = self
            .client
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let json: Value = response.json().await?;
        json["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse("transcription has no text".to_string()))
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for an OpenAI-style SSE completion stream.
pub struct StreamDecoder {
    buffer: String,
    tool_calls: BTreeMap<u64, PendingToolCall>,
    finish_reason: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(8192),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<CompletionChunk>, ProviderError> {
        self.buffer
            .push_str(&String::from_utf8_lossy(bytes).replace('\r', ""));

        let mut out = Vec::new();
        while let Some(frame) = self.extract_sse_frame() {
            self.handle_frame(&frame, &mut out)?;
            if self.finished {
                break;
            }
        }
        Ok(out)
    }

    /// Flushes pending tool calls and the terminal chunk if the upstream
    /// closed without `[DONE]`.
    pub fn finish(&mut self) -> Vec<CompletionChunk> {
        let mut out = Vec::new();
        if !self.finished {
            self.complete(&mut out);
        }
        out
    }

    fn extract_sse_frame(&mut self) -> Option<String> {
        loop {
            let pos = self.buffer.find("\n\n")?;
            let frame = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if !frame.trim().is_empty() {
                return Some(frame);
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: &str,
        out: &mut Vec<CompletionChunk>,
    ) -> Result<(), ProviderError> {
        let data = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("");
        if data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            trace!("Upstream stream sent [DONE]");
            self.complete(out);
            return Ok(());
        }

        let json: Value =
            serde_json::from_str(&data).map_err(|e| ProviderError::Parse(e.to_string()))?;

        if let Some(message) = json["error"]["message"].as_str() {
            out.push(CompletionChunk::Error(message.to_string()));
            return Ok(());
        }

        let choice = &json["choices"][0];
        if let Some(content) = choice["delta"]["content"].as_str() {
            if !content.is_empty() {
                out.push(CompletionChunk::TextDelta(content.to_string()));
            }
        }

        if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let pending = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    pending.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    pending.name.push_str(name);
                }
                if let Some(fragment) = call["function"]["arguments"].as_str() {
                    pending.arguments.push_str(fragment);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(normalize_finish_reason(reason));
        }

        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            out.push(CompletionChunk::Usage {
                prompt_tokens: usage["prompt_tokens"].as_i64().unwrap_or(0) as i32,
                completion_tokens: usage["completion_tokens"].as_i64().unwrap_or(0) as i32,
            });
        }

        Ok(())
    }

    fn complete(&mut self, out: &mut Vec<CompletionChunk>) {
        for (_, call) in std::mem::take(&mut self.tool_calls) {
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments).unwrap_or_else(|e| {
                    warn!("Tool call {} has malformed arguments: {}", call.id, e);
                    json!({})
                })
            };
            out.push(CompletionChunk::ToolCall {
                id: call.id,
                name: call.name,
                arguments,
            });
        }
        out.push(CompletionChunk::Done {
            finish_reason: self
                .finish_reason
                .take()
                .unwrap_or_else(|| FINISH_REASON_STOP.to_string()),
        });
        self.finished = true;
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_finish_reason(reason: &str) -> String {
    reason.replace('_', "-")
}
