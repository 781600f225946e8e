//! Durable checkpoint store.
//!
//! A checkpoint snapshots the execution state after one superstep. Channel
//! values are stored once per (channel, version) and shared across the
//! checkpoints that reference them; the checkpoint row itself carries only
//! the version map plus lineage metadata.

pub mod memory;
pub mod serde;
pub mod sqlite;

use std::collections::HashMap;

use ::serde::{Deserialize, Serialize};

use crate::checkpoint::serde::TaggedValue;
use crate::engine::error::EngineResult;

pub use memory::MemoryCheckpointer;
pub use sqlite::SqliteCheckpointer;

/// Virtual channel for deferred messages addressed to the next superstep.
pub const PENDING_SENDS: &str = "__pending_sends__";

/// Addresses a checkpoint lineage, and optionally one specific checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
    pub namespace: String,
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: namespace.into(),
            checkpoint_id: None,
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

/// One stored snapshot. `channel_values` holds only the channels resolved
/// from blob storage for this checkpoint's version map; `pending_sends` is
/// resolved from the parent's writes at load time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub channel_versions: HashMap<String, u64>,
    #[serde(default)]
    pub channel_values: HashMap<String, TaggedValue>,
    #[serde(default)]
    pub pending_sends: Vec<TaggedValue>,
    pub metadata: serde_json::Value,
}

impl Checkpoint {
    pub fn new(channel_versions: HashMap<String, u64>, metadata: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            // Fixed-width timestamps so lexicographic order is creation order.
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            channel_versions,
            channel_values: HashMap::new(),
            pending_sends: Vec::new(),
            metadata,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// An intermediate write attributed to a task within a superstep. Ordinals
/// preserve emission order within the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: u64,
    pub channel: String,
    pub value: TaggedValue,
}

/// A loaded checkpoint with its address, lineage, and pending writes.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub parent_config: Option<CheckpointConfig>,
    pub pending_writes: Vec<PendingWrite>,
}

/// Storage backend for checkpoints, channel blobs, and pending writes.
pub trait Checkpointer: Send + Sync {
    /// Loads the addressed checkpoint, or the latest one in the lineage when
    /// no id is given. Returns `None` for an empty lineage.
    fn get_tuple(&self, config: &CheckpointConfig) -> EngineResult<Option<CheckpointTuple>>;

    /// Checkpoints of a lineage, newest first. `before` excludes the named
    /// checkpoint and everything after it.
    fn list(
        &self,
        config: &CheckpointConfig,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> EngineResult<Vec<CheckpointTuple>>;

    /// Stores a checkpoint plus the blobs for channels that changed in this
    /// superstep. An existing (channel, version) blob is left untouched.
    /// Returns the address of the stored checkpoint.
    fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        new_values: HashMap<String, TaggedValue>,
    ) -> EngineResult<CheckpointConfig>;

    /// Attaches task writes to an existing checkpoint. Re-putting the same
    /// (task, ordinal) replaces that write.
    fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, TaggedValue)>,
        task_id: &str,
    ) -> EngineResult<()>;

    /// Records deferred messages on the producing checkpoint. Children see
    /// them as `pending_sends` via [`Checkpointer::get_tuple`].
    fn put_sends(
        &self,
        config: &CheckpointConfig,
        sends: Vec<TaggedValue>,
        task_id: &str,
    ) -> EngineResult<()> {
        let writes = sends
            .into_iter()
            .map(|value| (PENDING_SENDS.to_string(), value))
            .collect();
        self.put_writes(config, writes, task_id)
    }
}
