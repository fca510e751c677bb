//! Stream delivery controller
//!
//! Tracks per-chat generation state, mints stream identifiers, routes
//! generated output through the resumable registry when one is configured,
//! and answers resume requests with a live stream, a terminal snapshot or
//! nothing.

use crate::db::DBConnection;
use crate::models::chats::{MessageRole, NewStreamId};
use crate::resumable::{ChunkStream, ResumableStreams};
use crate::web::chat::constants::RESUME_SNAPSHOT_WINDOW_SECS;
use crate::web::chat::errors::ChatError;
use crate::web::chat::types::ChatMessage;
use crate::Surface;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Generating,
    Resumable,
    Terminal,
}

impl DeliveryState {
    fn is_running(self) -> bool {
        matches!(self, DeliveryState::Generating | DeliveryState::Resumable)
    }
}

/// Answer to a resume request.
pub enum ResumeOutcome {
    /// No registry is configured; there is nothing to resume.
    Unavailable,
    Live(ChunkStream),
    /// The most recent assistant message, finished moments ago.
    Snapshot(ChatMessage),
    Empty,
}

pub struct DeliveryController {
    db: Arc<dyn DBConnection + Send + Sync>,
    registry: Option<Arc<dyn ResumableStreams>>,
    states: Mutex<HashMap<Uuid, DeliveryState>>,
}

impl DeliveryController {
    pub fn new(
        db: Arc<dyn DBConnection + Send + Sync>,
        registry: Option<Arc<dyn ResumableStreams>>,
    ) -> Self {
        Self {
            db,
            registry,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.registry.is_some()
    }

    pub fn state(&self, chat_id: Uuid) -> DeliveryState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&chat_id).copied())
            .unwrap_or(DeliveryState::Idle)
    }

    fn set_state(&self, chat_id: Uuid, state: DeliveryState) {
        if let Ok(mut states) = self.states.lock() {
            match state {
                // Terminal stays visible until the next `begin` or `forget`
                DeliveryState::Idle => {
                    states.remove(&chat_id);
                }
                _ => {
                    states.insert(chat_id, state);
                }
            }
        }
        debug!("Chat {} delivery state -> {:?}", chat_id, state);
    }

    /// Moves the chat into `Generating`, rejecting a second concurrent
    /// generation on the same chat within this process.
    pub fn begin(self: &Arc<Self>, chat_id: Uuid) -> Result<GenerationTicket, ChatError> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| ChatError::GenerationInProgress(chat_id))?;
        if states
            .get(&chat_id)
            .map(|s| s.is_running())
            .unwrap_or(false)
        {
            info!("Rejecting concurrent generation for chat {}", chat_id);
            return Err(ChatError::GenerationInProgress(chat_id));
        }
        states.insert(chat_id, DeliveryState::Generating);
        drop(states);
        debug!("Chat {} delivery state -> Generating", chat_id);

        Ok(GenerationTicket {
            controller: self.clone(),
            chat_id,
            released: false,
        })
    }

    /// Drops any bookkeeping for a deleted chat.
    pub fn forget(&self, chat_id: Uuid) {
        self.set_state(chat_id, DeliveryState::Idle);
    }

    /// Records a new stream identifier before the model is invoked.
    pub fn mint_stream_id(&self, chat_id: Uuid) -> Result<Uuid, ChatError> {
        let stream = self.db.create_stream_id(NewStreamId {
            id: Uuid::new_v4(),
            chat_id,
        })?;
        debug!("Minted stream {} for chat {}", stream.id, chat_id);
        Ok(stream.id)
    }

    /// Routes generated output to the client, through the registry when one
    /// is available.
    pub async fn deliver(&self, stream_id: Uuid, source: ChunkStream) -> ChunkStream {
        match &self.registry {
            Some(registry) => registry.register(stream_id, source).await,
            None => source,
        }
    }

    /// Resolves the most recent stream for `chat_id`.
    ///
    /// Access checks are the caller's responsibility.
    pub async fn resume(
        &self,
        chat_id: Uuid,
        requested_at: DateTime<Utc>,
    ) -> Result<ResumeOutcome, ChatError> {
        let Some(registry) = &self.registry else {
            return Ok(ResumeOutcome::Unavailable);
        };

        let stream_ids = self.db.get_stream_ids_by_chat_id(chat_id)?;
        let latest = stream_ids
            .last()
            .ok_or(ChatError::NotFound(Surface::Stream))?;

        match registry.resume(latest.id).await {
            Ok(Some(stream)) => {
                info!("Resuming live stream {} for chat {}", latest.id, chat_id);
                if self.state(chat_id) == DeliveryState::Generating {
                    self.set_state(chat_id, DeliveryState::Resumable);
                }
                return Ok(ResumeOutcome::Live(stream));
            }
            Ok(None) => {}
            Err(e) => warn!("Resumable registry lookup failed for {}: {}", latest.id, e),
        }

        self.snapshot(chat_id, requested_at)
    }

    fn snapshot(
        &self,
        chat_id: Uuid,
        requested_at: DateTime<Utc>,
    ) -> Result<ResumeOutcome, ChatError> {
        let rows = self.db.get_messages_by_chat_id(chat_id)?;
        let Some(latest) = rows.into_iter().last() else {
            return Ok(ResumeOutcome::Empty);
        };
        if latest.role != MessageRole::Assistant {
            return Ok(ResumeOutcome::Empty);
        }
        let age = requested_at.signed_duration_since(latest.created_at);
        if age.num_seconds() > RESUME_SNAPSHOT_WINDOW_SECS {
            debug!(
                "Latest assistant message for chat {} is {}s old, nothing to replay",
                chat_id,
                age.num_seconds()
            );
            return Ok(ResumeOutcome::Empty);
        }
        Ok(ResumeOutcome::Snapshot(ChatMessage::try_from(latest)?))
    }
}

/// Held for the lifetime of one generation. Finishing it marks the chat
/// `Terminal`; dropping it unfinished returns the chat to `Idle`.
pub struct GenerationTicket {
    controller: Arc<DeliveryController>,
    chat_id: Uuid,
    released: bool,
}

impl GenerationTicket {
    pub fn finish(mut self) {
        self.released = true;
        self.controller.set_state(self.chat_id, DeliveryState::Terminal);
    }
}

impl Drop for GenerationTicket {
    fn drop(&mut self) {
        if !self.released {
            self.controller.set_state(self.chat_id, DeliveryState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chats::{NewChat, NewMessage, Visibility};
    use crate::resumable::memory::MemoryStreams;
    use crate::test_utils::MemoryDb;
    use chrono::Duration;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn chat(db: &MemoryDb) -> Uuid {
        let id = Uuid::new_v4();
        db.create_chat(NewChat {
            id,
            user_id: Uuid::new_v4(),
            title: "t".to_string(),
            visibility: Visibility::Private,
        })
        .unwrap();
        id
    }

    fn assistant_row(chat_id: Uuid, created_at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4(),
            chat_id,
            role: MessageRole::Assistant,
            parts: json!([{"type": "text", "text": "finished answer"}]),
            attachments: json!([]),
            created_at,
        }
    }

    fn controller(db: Arc<MemoryDb>, resumable: bool) -> Arc<DeliveryController> {
        let registry: Option<Arc<dyn ResumableStreams>> = if resumable {
            Some(Arc::new(MemoryStreams::new()))
        } else {
            None
        };
        Arc::new(DeliveryController::new(db, registry))
    }

    #[tokio::test]
    async fn test_resume_snapshot_within_window() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let finished_at = Utc::now();
        let controller = controller(db.clone(), true);
        controller.mint_stream_id(chat_id).unwrap();
        db.save_messages(vec![assistant_row(chat_id, finished_at)])
            .unwrap();

        let outcome = controller
            .resume(chat_id, finished_at + Duration::seconds(10))
            .await
            .unwrap();
        let ResumeOutcome::Snapshot(message) = outcome else {
            panic!("expected snapshot");
        };
        assert_eq!(message.text(), "finished answer");
    }

    #[tokio::test]
    async fn test_resume_after_window_is_empty() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let finished_at = Utc::now();
        let controller = controller(db.clone(), true);
        controller.mint_stream_id(chat_id).unwrap();
        db.save_messages(vec![assistant_row(chat_id, finished_at)])
            .unwrap();

        let outcome = controller
            .resume(chat_id, finished_at + Duration::seconds(20))
            .await
            .unwrap();
        assert!(matches!(outcome, ResumeOutcome::Empty));
    }

    #[tokio::test]
    async fn test_resume_when_last_message_is_user_is_empty() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let controller = controller(db.clone(), true);
        controller.mint_stream_id(chat_id).unwrap();
        let mut row = assistant_row(chat_id, Utc::now());
        row.role = MessageRole::User;
        db.save_messages(vec![row]).unwrap();

        let outcome = controller.resume(chat_id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, ResumeOutcome::Empty));
    }

    #[tokio::test]
    async fn test_resume_without_stream_ids_is_not_found() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let controller = controller(db, true);
        let result = controller.resume(chat_id, Utc::now()).await;
        assert!(matches!(result, Err(ChatError::NotFound(Surface::Stream))));
    }

    #[tokio::test]
    async fn test_resume_without_registry_is_unavailable() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let controller = controller(db, false);
        let outcome = controller.resume(chat_id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, ResumeOutcome::Unavailable));
    }

    #[tokio::test]
    async fn test_resume_live_stream_marks_resumable() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let controller = controller(db, true);
        let ticket = controller.begin(chat_id).unwrap();
        let stream_id = controller.mint_stream_id(chat_id).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let original = controller
            .deliver(stream_id, ReceiverStream::new(rx).boxed())
            .await;
        drop(original);
        tx.send("chunk".to_string()).await.unwrap();

        let ResumeOutcome::Live(stream) = controller.resume(chat_id, Utc::now()).await.unwrap()
        else {
            panic!("expected live stream");
        };
        assert_eq!(controller.state(chat_id), DeliveryState::Resumable);

        drop(tx);
        let chunks: Vec<String> = stream.collect().await;
        assert_eq!(chunks, vec!["chunk"]);

        ticket.finish();
        assert_eq!(controller.state(chat_id), DeliveryState::Terminal);

        let next = controller.begin(chat_id).unwrap();
        assert_eq!(controller.state(chat_id), DeliveryState::Generating);
        drop(next);
        assert_eq!(controller.state(chat_id), DeliveryState::Idle);
    }

    #[tokio::test]
    async fn test_single_flight_per_chat() {
        let db = Arc::new(MemoryDb::new());
        let chat_id = chat(&db);
        let controller = controller(db, false);

        let ticket = controller.begin(chat_id).unwrap();
        assert_eq!(controller.state(chat_id), DeliveryState::Generating);
        assert!(matches!(
            controller.begin(chat_id),
            Err(ChatError::GenerationInProgress(_))
        ));
        assert!(controller.begin(Uuid::new_v4()).is_ok());

        drop(ticket);
        assert!(controller.begin(chat_id).is_ok());
    }

    #[tokio::test]
    async fn test_direct_delivery_without_registry() {
        let db = Arc::new(MemoryDb::new());
        let controller = controller(db, false);
        let source = futures::stream::iter(vec!["a".to_string()]).boxed();
        let out: Vec<String> = controller.deliver(Uuid::new_v4(), source).await.collect().await;
        assert_eq!(out, vec!["a"]);
    }
}
