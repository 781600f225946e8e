//! In-memory checkpointer for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::checkpoint::serde::TaggedValue;
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointTuple, Checkpointer, PendingWrite, PENDING_SENDS,
};
use crate::engine::error::{EngineError, EngineResult};

type LineageKey = (String, String);
type BlobKey = (String, String, String, u64);

#[derive(Default)]
struct Inner {
    /// Checkpoints per lineage, in insertion order.
    checkpoints: HashMap<LineageKey, Vec<Checkpoint>>,
    /// Channel blobs keyed by (thread, namespace, channel, version).
    blobs: HashMap<BlobKey, TaggedValue>,
    /// Pending writes keyed by (thread, namespace, checkpoint id).
    writes: HashMap<(String, String, String), Vec<PendingWrite>>,
}

/// Checkpoint store backed by process memory.
#[derive(Default)]
pub struct MemoryCheckpointer {
    inner: Mutex<Inner>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lineage_key(config: &CheckpointConfig) -> LineageKey {
    (config.thread_id.clone(), config.namespace.clone())
}

fn sort_key(checkpoint: &Checkpoint) -> (String, String) {
    (checkpoint.created_at.clone(), checkpoint.id.clone())
}

impl Inner {
    fn resolve(&self, config: &CheckpointConfig, stored: &Checkpoint) -> CheckpointTuple {
        let mut checkpoint = stored.clone();

        for (channel, version) in &checkpoint.channel_versions {
            let key = (
                config.thread_id.clone(),
                config.namespace.clone(),
                channel.clone(),
                *version,
            );
            if let Some(value) = self.blobs.get(&key) {
                checkpoint
                    .channel_values
                    .insert(channel.clone(), value.clone());
            }
        }

        if let Some(parent_id) = &checkpoint.parent_id {
            let parent_key = (
                config.thread_id.clone(),
                config.namespace.clone(),
                parent_id.clone(),
            );
            if let Some(parent_writes) = self.writes.get(&parent_key) {
                let mut sends: Vec<&PendingWrite> = parent_writes
                    .iter()
                    .filter(|write| write.channel == PENDING_SENDS)
                    .collect();
                sends.sort_by(|a, b| (&a.task_id, a.idx).cmp(&(&b.task_id, b.idx)));
                checkpoint.pending_sends = sends.into_iter().map(|w| w.value.clone()).collect();
            }
        }

        let write_key = (
            config.thread_id.clone(),
            config.namespace.clone(),
            checkpoint.id.clone(),
        );
        let mut pending_writes = self.writes.get(&write_key).cloned().unwrap_or_default();
        pending_writes.sort_by(|a, b| (&a.task_id, a.idx).cmp(&(&b.task_id, b.idx)));

        let parent_config = checkpoint.parent_id.as_ref().map(|parent_id| {
            CheckpointConfig::new(&config.thread_id, &config.namespace)
                .with_checkpoint_id(parent_id)
        });

        CheckpointTuple {
            config: CheckpointConfig::new(&config.thread_id, &config.namespace)
                .with_checkpoint_id(&checkpoint.id),
            checkpoint,
            parent_config,
            pending_writes,
        }
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn get_tuple(&self, config: &CheckpointConfig) -> EngineResult<Option<CheckpointTuple>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("checkpointer lock poisoned".to_string()))?;
        let Some(lineage) = inner.checkpoints.get(&lineage_key(config)) else {
            return Ok(None);
        };

        let stored = match &config.checkpoint_id {
            Some(id) => lineage.iter().find(|c| &c.id == id),
            None => lineage.iter().max_by_key(|c| sort_key(c)),
        };
        Ok(stored.map(|stored| inner.resolve(config, stored)))
    }

    fn list(
        &self,
        config: &CheckpointConfig,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> EngineResult<Vec<CheckpointTuple>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("checkpointer lock poisoned".to_string()))?;
        let Some(lineage) = inner.checkpoints.get(&lineage_key(config)) else {
            return Ok(Vec::new());
        };

        let before_key = before
            .and_then(|id| lineage.iter().find(|c| c.id == id))
            .map(sort_key);

        let mut matching: Vec<&Checkpoint> = lineage
            .iter()
            .filter(|c| match &before_key {
                Some(key) => sort_key(c) < *key,
                None => true,
            })
            .collect();
        matching.sort_by_key(|c| sort_key(c));
        matching.reverse();
        if let Some(limit) = limit {
            matching.truncate(limit);
        }

        Ok(matching
            .into_iter()
            .map(|stored| inner.resolve(config, stored))
            .collect())
    }

    fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        new_values: HashMap<String, TaggedValue>,
    ) -> EngineResult<CheckpointConfig> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("checkpointer lock poisoned".to_string()))?;

        for (channel, value) in new_values {
            let Some(version) = checkpoint.channel_versions.get(&channel).copied() else {
                return Err(EngineError::Store(format!(
                    "channel {:?} has a value but no version",
                    channel
                )));
            };
            let key = (
                config.thread_id.clone(),
                config.namespace.clone(),
                channel,
                version,
            );
            // First write wins; a stored version is immutable.
            inner.blobs.entry(key).or_insert(value);
        }

        let id = checkpoint.id.clone();
        let mut stored = checkpoint;
        stored.channel_values.clear();
        stored.pending_sends.clear();
        inner
            .checkpoints
            .entry(lineage_key(config))
            .or_default()
            .push(stored);

        Ok(CheckpointConfig::new(&config.thread_id, &config.namespace).with_checkpoint_id(id))
    }

    fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, TaggedValue)>,
        task_id: &str,
    ) -> EngineResult<()> {
        let checkpoint_id = config.checkpoint_id.clone().ok_or_else(|| {
            EngineError::Store("put_writes requires a checkpoint id".to_string())
        })?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("checkpointer lock poisoned".to_string()))?;

        let key = (
            config.thread_id.clone(),
            config.namespace.clone(),
            checkpoint_id,
        );
        let stored = inner.writes.entry(key).or_default();
        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            let write = PendingWrite {
                task_id: task_id.to_string(),
                idx: idx as u64,
                channel,
                value,
            };
            match stored
                .iter_mut()
                .find(|w| w.task_id == write.task_id && w.idx == write.idx)
            {
                Some(existing) => *existing = write,
                None => stored.push(write),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryCheckpointer;
    use crate::checkpoint::serde::TaggedValue;
    use crate::checkpoint::{Checkpoint, CheckpointConfig, Checkpointer, PENDING_SENDS};
    use std::collections::HashMap;

    fn config() -> CheckpointConfig {
        CheckpointConfig::new("thread-1", "ns")
    }

    fn versions(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs
            .iter()
            .map(|(channel, version)| (channel.to_string(), *version))
            .collect()
    }

    #[test]
    fn get_latest_resolves_channel_values() {
        let store = MemoryCheckpointer::new();
        let checkpoint = Checkpoint::new(versions(&[("messages", 1)]), serde_json::json!({}));
        let mut values = HashMap::new();
        values.insert(
            "messages".to_string(),
            TaggedValue::json(serde_json::json!(["hello"])),
        );
        store.put(&config(), checkpoint, values).unwrap();

        let tuple = store.get_tuple(&config()).unwrap().unwrap();
        assert_eq!(
            tuple.checkpoint.channel_values["messages"],
            TaggedValue::json(serde_json::json!(["hello"]))
        );
        assert!(tuple.parent_config.is_none());
    }

    #[test]
    fn blobs_are_immutable_per_version() {
        let store = MemoryCheckpointer::new();

        let first = Checkpoint::new(versions(&[("plan", 1)]), serde_json::json!({}));
        let mut values = HashMap::new();
        values.insert("plan".to_string(), TaggedValue::json(serde_json::json!("original")));
        store.put(&config(), first, values).unwrap();

        // Same version written again with different content is ignored.
        let second = Checkpoint::new(versions(&[("plan", 1)]), serde_json::json!({}));
        let mut values = HashMap::new();
        values.insert("plan".to_string(), TaggedValue::json(serde_json::json!("clobbered")));
        store.put(&config(), second, values).unwrap();

        let tuple = store.get_tuple(&config()).unwrap().unwrap();
        assert_eq!(
            tuple.checkpoint.channel_values["plan"],
            TaggedValue::json(serde_json::json!("original"))
        );
    }

    #[test]
    fn list_returns_newest_first_with_parent_links() {
        let store = MemoryCheckpointer::new();
        let first = Checkpoint::new(versions(&[]), serde_json::json!({"step": 0}));
        let first_id = first.id.clone();
        store.put(&config(), first, HashMap::new()).unwrap();

        let second =
            Checkpoint::new(versions(&[]), serde_json::json!({"step": 1})).with_parent(&first_id);
        let second_id = second.id.clone();
        store.put(&config(), second, HashMap::new()).unwrap();

        let tuples = store.list(&config(), None, None).unwrap();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].checkpoint.id, second_id);
        assert_eq!(
            tuples[0].parent_config.as_ref().unwrap().checkpoint_id,
            Some(first_id.clone())
        );

        let before = store.list(&config(), None, Some(&second_id)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].checkpoint.id, first_id);
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = MemoryCheckpointer::new();
        let checkpoint = Checkpoint::new(versions(&[]), serde_json::json!({}));
        store.put(&config(), checkpoint, HashMap::new()).unwrap();

        let other = CheckpointConfig::new("thread-1", "other-ns");
        assert!(store.get_tuple(&other).unwrap().is_none());
    }

    #[test]
    fn pending_sends_come_from_the_parent() {
        let store = MemoryCheckpointer::new();
        let parent = Checkpoint::new(versions(&[]), serde_json::json!({}));
        let parent_id = parent.id.clone();
        let parent_config = store.put(&config(), parent, HashMap::new()).unwrap();

        store
            .put_writes(
                &parent_config,
                vec![(
                    PENDING_SENDS.to_string(),
                    TaggedValue::json(serde_json::json!("deferred")),
                )],
                "task-1",
            )
            .unwrap();

        let child = Checkpoint::new(versions(&[]), serde_json::json!({})).with_parent(&parent_id);
        store.put(&config(), child, HashMap::new()).unwrap();

        let tuple = store.get_tuple(&config()).unwrap().unwrap();
        assert_eq!(
            tuple.checkpoint.pending_sends,
            vec![TaggedValue::json(serde_json::json!("deferred"))]
        );
    }

    #[test]
    fn put_writes_replaces_same_task_and_ordinal() {
        let store = MemoryCheckpointer::new();
        let checkpoint = Checkpoint::new(versions(&[]), serde_json::json!({}));
        let stored = store.put(&config(), checkpoint, HashMap::new()).unwrap();

        store
            .put_writes(
                &stored,
                vec![("messages".to_string(), TaggedValue::json(serde_json::json!("v1")))],
                "task-1",
            )
            .unwrap();
        store
            .put_writes(
                &stored,
                vec![("messages".to_string(), TaggedValue::json(serde_json::json!("v2")))],
                "task-1",
            )
            .unwrap();

        let tuple = store.get_tuple(&config()).unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(
            tuple.pending_writes[0].value,
            TaggedValue::json(serde_json::json!("v2"))
        );
    }
}
