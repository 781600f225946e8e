//! Stream buffer: batches events into an append-only chunk log.
//!
//! Events are accepted synchronously and flushed on a fixed interval by a
//! background task, so the log sees a few large appends instead of one write
//! per token. Whatever remains in the buffer is flushed when the buffer is
//! finished, batching deadline or not.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::constants::FLUSH_INTERVAL;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::event::{EventSink, StreamEvent};

/// Append-only log of flushed event batches, readable by cursor.
pub trait ChunkLog: Send + Sync {
    fn append(&self, run_id: &str, events: &[StreamEvent]) -> EngineResult<()>;

    /// Events with a sequence number greater than `after`, in order. Pass 0
    /// for the full log; pass the last seen sequence number to poll for new
    /// chunks.
    fn chunks_since(&self, run_id: &str, after: u64) -> EngineResult<Vec<(u64, StreamEvent)>>;
}

/// Chunk log backed by process memory.
#[derive(Default)]
pub struct MemoryChunkLog {
    chunks: Mutex<HashMap<String, Vec<StreamEvent>>>,
}

impl MemoryChunkLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks stored for a run.
    pub fn len(&self, run_id: &str) -> usize {
        self.chunks
            .lock()
            .map(|chunks| chunks.get(run_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl ChunkLog for MemoryChunkLog {
    fn append(&self, run_id: &str, events: &[StreamEvent]) -> EngineResult<()> {
        let mut chunks = self
            .chunks
            .lock()
            .map_err(|_| EngineError::Store("chunk log lock poisoned".to_string()))?;
        chunks
            .entry(run_id.to_string())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    fn chunks_since(&self, run_id: &str, after: u64) -> EngineResult<Vec<(u64, StreamEvent)>> {
        let chunks = self
            .chunks
            .lock()
            .map_err(|_| EngineError::Store("chunk log lock poisoned".to_string()))?;
        Ok(chunks
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(idx, event)| (idx as u64 + 1, event.clone()))
                    .filter(|(seq, _)| *seq > after)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Chunk log backed by SQLite, for logs that outlive the process.
pub struct SqliteChunkLog {
    conn: Mutex<Connection>,
}

impl SqliteChunkLog {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stream_chunks (
                 seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id  TEXT NOT NULL,
                 payload TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_stream_chunks_run ON stream_chunks (run_id, seq);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ChunkLog for SqliteChunkLog {
    fn append(&self, run_id: &str, events: &[StreamEvent]) -> EngineResult<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Store("chunk log lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for event in events {
            tx.execute(
                "INSERT INTO stream_chunks (run_id, payload) VALUES (?1, ?2)",
                params![run_id, serde_json::to_string(event)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn chunks_since(&self, run_id: &str, after: u64) -> EngineResult<Vec<(u64, StreamEvent)>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Store("chunk log lock poisoned".to_string()))?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, payload FROM stream_chunks
             WHERE run_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id, after], |row| {
            let seq: u64 = row.get(0)?;
            let payload: String = row.get(1)?;
            Ok((seq, payload))
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            let (seq, payload) = row?;
            chunks.push((seq, serde_json::from_str(&payload)?));
        }
        Ok(chunks)
    }
}

/// Batching sink in front of a chunk log. Emission never blocks on storage.
pub struct StreamBuffer {
    sender: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    worker: Mutex<Option<JoinHandle<EngineResult<usize>>>>,
}

impl StreamBuffer {
    /// Spawns the flush worker with the default interval.
    pub fn spawn(run_id: impl Into<String>, log: Arc<dyn ChunkLog>) -> Self {
        Self::spawn_with_interval(run_id, log, FLUSH_INTERVAL)
    }

    pub fn spawn_with_interval(
        run_id: impl Into<String>,
        log: Arc<dyn ChunkLog>,
        interval: std::time::Duration,
    ) -> Self {
        let run_id = run_id.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<StreamEvent>();

        let worker = tokio::spawn(async move {
            let mut pending: Vec<StreamEvent> = Vec::new();
            let mut flushed = 0usize;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(event) => pending.push(event),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            log.append(&run_id, &pending)?;
                            flushed += pending.len();
                            pending.clear();
                        }
                    }
                }
            }

            // Final flush regardless of the interval.
            if !pending.is_empty() {
                log.append(&run_id, &pending)?;
                flushed += pending.len();
            }
            tracing::debug!(run_id = %run_id, flushed, "stream buffer drained");
            Ok(flushed)
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Closes the buffer, waits for the final flush, and returns the total
    /// number of events written to the log. Idempotent; later calls return 0.
    pub async fn finish(&self) -> EngineResult<usize> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| EngineError::Store("stream buffer lock poisoned".to_string()))?
            .take();
        drop(sender);
        let worker = self
            .worker
            .lock()
            .map_err(|_| EngineError::Store("stream buffer lock poisoned".to_string()))?
            .take();
        match worker {
            Some(handle) => handle
                .await
                .map_err(|_| EngineError::Store("stream flush worker panicked".to_string()))?,
            None => Ok(0),
        }
    }
}

impl EventSink for StreamBuffer {
    fn emit(&self, event: StreamEvent) -> EngineResult<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| EngineError::Store("stream buffer lock poisoned".to_string()))?;
        match sender.as_ref() {
            Some(sender) => sender
                .send(event)
                .map_err(|_| EngineError::Store("stream flush worker stopped".to_string())),
            None => Err(EngineError::Store(
                "stream buffer already finished".to_string(),
            )),
        }
    }
}
