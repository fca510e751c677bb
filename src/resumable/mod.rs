//! Resumable stream registry
//!
//! Maps a stream identifier onto the serialized output of one generation so
//! a reconnecting client can replay it. The registry is built once at startup
//! and handed to the delivery controller as an optional capability; when it
//! is absent, generation streams directly and resume requests are answered
//! with an empty response.

pub mod memory;
pub mod redis_store;

use crate::config::ResumableBackend;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Serialized data-stream parts, one JSON document per item.
pub type ChunkStream = BoxStream<'static, String>;

/// Buffered output is kept this long after the last write.
pub const STREAM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ResumableError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait::async_trait]
pub trait ResumableStreams: Send + Sync {
    /// Starts buffering `source` under `stream_id` and returns a stream for
    /// the caller that registered it.
    ///
    /// `source` is driven to completion by the registry whether or not the
    /// returned stream is still being polled. A backend that cannot buffer
    /// hands `source` back unchanged, so the caller still streams directly.
    async fn register(&self, stream_id: Uuid, source: ChunkStream) -> ChunkStream;

    /// Replays everything buffered so far and follows the live tail.
    ///
    /// Returns `None` when nothing is live under `stream_id`, either because
    /// it never existed here or because it already finished.
    async fn resume(&self, stream_id: Uuid) -> Result<Option<ChunkStream>, ResumableError>;
}

/// Builds the registry for the configured backend. Construction failures
/// degrade to `None` so the server still starts without resumption.
pub async fn init(backend: &ResumableBackend) -> Option<Arc<dyn ResumableStreams>> {
    match backend {
        ResumableBackend::Disabled => {
            info!("Resumable streams disabled; responses will stream directly");
            None
        }
        ResumableBackend::Memory => {
            info!("Using in-process resumable stream registry");
            Some(Arc::new(memory::MemoryStreams::new()))
        }
        ResumableBackend::Redis(url) => {
            match tokio::time::timeout(CONNECT_TIMEOUT, redis_store::RedisStreams::connect(url))
                .await
            {
                Ok(Ok(streams)) => {
                    info!("Resumable streams backed by Redis");
                    Some(Arc::new(streams))
                }
                Ok(Err(e)) => {
                    warn!("Redis unavailable, resumable streams disabled: {}", e);
                    None
                }
                Err(_) => {
                    warn!("Timed out connecting to Redis, resumable streams disabled");
                    None
                }
            }
        }
    }
}
