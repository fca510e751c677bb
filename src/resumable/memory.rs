//! In-process registry, for single-instance deployments and tests

use super::{ChunkStream, ResumableError, ResumableStreams};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct Buffer {
    chunks: Vec<String>,
    done: bool,
}

#[derive(Default)]
struct Entry {
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Entry {
    fn push(&self, chunk: String) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.chunks.push(chunk);
        }
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.done = true;
        }
        self.notify.notify_waiters();
    }

    /// Chunks from `from` onward, and whether the source has ended.
    fn read_from(&self, from: usize) -> (Vec<String>, bool) {
        match self.buffer.lock() {
            Ok(buffer) => (
                buffer.chunks.get(from..).map(<[String]>::to_vec).unwrap_or_default(),
                buffer.done,
            ),
            Err(_) => (Vec::new(), true),
        }
    }
}

/// Follows an entry from its first chunk until the source ends.
fn follow(entry: Arc<Entry>) -> ChunkStream {
    async_stream::stream! {
        let mut cursor = 0;
        loop {
            let notified = entry.notify.notified();
            let (chunks, done) = entry.read_from(cursor);
            cursor += chunks.len();
            for chunk in chunks {
                yield chunk;
            }
            if done {
                break;
            }
            notified.await;
        }
    }
    .boxed()
}

pub struct MemoryStreams {
    entries: Arc<Mutex<HashMap<Uuid, Arc<Entry>>>>,
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn live_entry(&self, stream_id: Uuid) -> Option<Arc<Entry>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&stream_id).cloned())
    }
}

impl Default for MemoryStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResumableStreams for MemoryStreams {
    async fn register(&self, stream_id: Uuid, mut source: ChunkStream) -> ChunkStream {
        let entry = Arc::new(Entry::default());
        {
            let Ok(mut entries) = self.entries.lock() else {
                warn!("Stream registry lock poisoned, streaming {} directly", stream_id);
                return source;
            };
            if entries.contains_key(&stream_id) {
                warn!("Stream {} already registered, streaming directly", stream_id);
                return source;
            }
            entries.insert(stream_id, entry.clone());
        }
        debug!("Registered in-memory stream {}", stream_id);

        let pump_entry = entry.clone();
        let entries = self.entries.clone();
        tokio::spawn(async move {
            while let Some(chunk) = source.next().await {
                trace!("Buffered chunk for stream {}", stream_id);
                pump_entry.push(chunk);
            }
            pump_entry.finish();
            if let Ok(mut entries) = entries.lock() {
                entries.remove(&stream_id);
            }
            debug!("In-memory stream {} finished", stream_id);
        });

        follow(entry)
    }

    async fn resume(&self, stream_id: Uuid) -> Result<Option<ChunkStream>, ResumableError> {
        Ok(self.live_entry(stream_id).map(follow))
    }
}
