//! Redis-backed registry, shared across server instances
//!
//! Each stream keeps two keys: a list of serialized chunks and a state
//! marker that reads `live` while the source is producing and `done` after.

use super::{ChunkStream, ResumableError, ResumableStreams, STREAM_TTL};
use crate::web::chat::constants::CLIENT_CHANNEL_BUFFER;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "chat:stream:";
const STATE_LIVE: &str = "live";
const STATE_DONE: &str = "done";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn chunks_key(stream_id: Uuid) -> String {
    format!("{}{}:chunks", KEY_PREFIX, stream_id)
}

fn state_key(stream_id: Uuid) -> String {
    format!("{}{}:state", KEY_PREFIX, stream_id)
}

#[derive(Clone)]
pub struct RedisStreams {
    manager: ConnectionManager,
}

impl RedisStreams {
    pub async fn connect(url: &str) -> Result<Self, ResumableError> {
        info!("Connecting to Redis for resumable streams");
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    async fn set_state(&self, stream_id: Uuid, state: &str) -> Result<(), ResumableError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(state_key(stream_id), state, STREAM_TTL.as_secs())
            .await?;
        Ok(())
    }

    async fn append(&self, stream_id: Uuid, chunk: &str) -> Result<(), ResumableError> {
        let key = chunks_key(stream_id);
        let mut conn = self.manager.clone();
        conn.rpush::<_, _, ()>(&key, chunk).await?;
        conn.expire::<_, ()>(&key, STREAM_TTL.as_secs() as i64).await?;
        Ok(())
    }

    async fn state(&self, stream_id: Uuid) -> Result<Option<String>, ResumableError> {
        let mut conn = self.manager.clone();
        let state: Option<String> = conn.get(state_key(stream_id)).await?;
        Ok(state)
    }

    async fn read_from(&self, stream_id: Uuid, from: usize) -> Result<Vec<String>, ResumableError> {
        let mut conn = self.manager.clone();
        let chunks: Vec<String> = conn.lrange(chunks_key(stream_id), from as isize, -1).await?;
        Ok(chunks)
    }

    fn follow(&self, stream_id: Uuid) -> ChunkStream {
        let store = self.clone();
        async_stream::stream! {
            let mut cursor = 0;
            loop {
                // Read the state first so chunks appended before `done` are
                // always drained on the final pass.
                let state = match store.state(stream_id).await {
                    Ok(state) => state,
                    Err(e) => {
                        error!("Failed to read state for stream {}: {}", stream_id, e);
                        break;
                    }
                };
                let chunks = match store.read_from(stream_id, cursor).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        error!("Failed to read chunks for stream {}: {}", stream_id, e);
                        break;
                    }
                };
                cursor += chunks.len();
                for chunk in chunks {
                    yield chunk;
                }
                if state.as_deref() != Some(STATE_LIVE) {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        .boxed()
    }
}

#[async_trait::async_trait]
impl ResumableStreams for RedisStreams {
    async fn register(&self, stream_id: Uuid, mut source: ChunkStream) -> ChunkStream {
        match self.state(stream_id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                warn!("Stream {} already registered, streaming directly", stream_id);
                return source;
            }
            Err(e) => {
                warn!("Redis unavailable, streaming {} directly: {}", stream_id, e);
                return source;
            }
        }
        if let Err(e) = self.set_state(stream_id, STATE_LIVE).await {
            warn!("Failed to register stream {}, streaming directly: {}", stream_id, e);
            return source;
        }
        debug!("Registered Redis stream {}", stream_id);

        let (tx_client, rx_client) = mpsc::channel::<String>(CLIENT_CHANNEL_BUFFER);
        let store = self.clone();
        tokio::spawn(async move {
            let mut client_alive = true;
            while let Some(chunk) = source.next().await {
                if let Err(e) = store.append(stream_id, &chunk).await {
                    error!("Failed to buffer chunk for stream {}: {}", stream_id, e);
                }
                if client_alive && tx_client.try_send(chunk).is_err() {
                    debug!("Client stopped receiving stream {}, buffering only", stream_id);
                    client_alive = false;
                }
            }
            if let Err(e) = store.set_state(stream_id, STATE_DONE).await {
                error!("Failed to mark stream {} done: {}", stream_id, e);
            }
            debug!("Redis stream {} finished", stream_id);
        });

        ReceiverStream::new(rx_client).boxed()
    }

    async fn resume(&self, stream_id: Uuid) -> Result<Option<ChunkStream>, ResumableError> {
        match self.state(stream_id).await?.as_deref() {
            Some(STATE_LIVE) => Ok(Some(self.follow(stream_id))),
            _ => Ok(None),
        }
    }
}
