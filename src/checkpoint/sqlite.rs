//! SQLite-backed checkpointer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::checkpoint::serde::TaggedValue;
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointTuple, Checkpointer, PendingWrite, PENDING_SENDS,
};
use crate::engine::error::{EngineError, EngineResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id        TEXT NOT NULL,
    namespace        TEXT NOT NULL,
    checkpoint_id    TEXT NOT NULL,
    parent_id        TEXT,
    created_at       TEXT NOT NULL,
    channel_versions TEXT NOT NULL,
    metadata         TEXT NOT NULL,
    PRIMARY KEY (thread_id, namespace, checkpoint_id)
);
CREATE TABLE IF NOT EXISTS channel_blobs (
    thread_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    channel   TEXT NOT NULL,
    version   INTEGER NOT NULL,
    tag       TEXT NOT NULL,
    payload   BLOB NOT NULL,
    PRIMARY KEY (thread_id, namespace, channel, version)
);
CREATE TABLE IF NOT EXISTS pending_writes (
    thread_id     TEXT NOT NULL,
    namespace     TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    task_id       TEXT NOT NULL,
    idx           INTEGER NOT NULL,
    channel       TEXT NOT NULL,
    tag           TEXT NOT NULL,
    payload       BLOB NOT NULL,
    PRIMARY KEY (thread_id, namespace, checkpoint_id, task_id, idx)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_lineage
    ON checkpoints (thread_id, namespace, created_at DESC, checkpoint_id DESC);
";

/// Checkpoint store backed by a SQLite database file (or `:memory:`).
pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointer {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Store("checkpointer lock poisoned".to_string()))
    }
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let versions_json: String = row.get("channel_versions")?;
    let metadata_json: String = row.get("metadata")?;
    Ok(Checkpoint {
        id: row.get("checkpoint_id")?,
        parent_id: row.get("parent_id")?,
        created_at: row.get("created_at")?,
        channel_versions: serde_json::from_str(&versions_json).unwrap_or_default(),
        channel_values: HashMap::new(),
        pending_sends: Vec::new(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
    })
}

fn resolve(
    conn: &Connection,
    config: &CheckpointConfig,
    mut checkpoint: Checkpoint,
) -> EngineResult<CheckpointTuple> {
    let mut blob_stmt = conn.prepare_cached(
        "SELECT tag, payload FROM channel_blobs
         WHERE thread_id = ?1 AND namespace = ?2 AND channel = ?3 AND version = ?4",
    )?;
    let versions: Vec<(String, u64)> = checkpoint
        .channel_versions
        .iter()
        .map(|(channel, version)| (channel.clone(), *version))
        .collect();
    for (channel, version) in versions {
        let found = blob_stmt
            .query_row(
                params![config.thread_id, config.namespace, channel, version],
                |row| {
                    let tag: String = row.get(0)?;
                    let payload: Vec<u8> = row.get(1)?;
                    Ok((tag, payload))
                },
            )
            .optional()?;
        if let Some((tag, payload)) = found {
            checkpoint
                .channel_values
                .insert(channel, TaggedValue::from_parts(&tag, payload)?);
        }
    }

    let mut write_stmt = conn.prepare_cached(
        "SELECT task_id, idx, channel, tag, payload FROM pending_writes
         WHERE thread_id = ?1 AND namespace = ?2 AND checkpoint_id = ?3
         ORDER BY task_id, idx",
    )?;
    let mut read_writes = |checkpoint_id: &str| -> EngineResult<Vec<PendingWrite>> {
        let rows = write_stmt.query_map(
            params![config.thread_id, config.namespace, checkpoint_id],
            |row| {
                let tag: String = row.get(3)?;
                let payload: Vec<u8> = row.get(4)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    tag,
                    payload,
                ))
            },
        )?;
        let mut writes = Vec::new();
        for row in rows {
            let (task_id, idx, channel, tag, payload) = row?;
            writes.push(PendingWrite {
                task_id,
                idx,
                channel,
                value: TaggedValue::from_parts(&tag, payload)?,
            });
        }
        Ok(writes)
    };

    if let Some(parent_id) = checkpoint.parent_id.clone() {
        checkpoint.pending_sends = read_writes(&parent_id)?
            .into_iter()
            .filter(|write| write.channel == PENDING_SENDS)
            .map(|write| write.value)
            .collect();
    }
    let pending_writes = read_writes(&checkpoint.id)?;

    let parent_config = checkpoint.parent_id.as_ref().map(|parent_id| {
        CheckpointConfig::new(&config.thread_id, &config.namespace).with_checkpoint_id(parent_id)
    });

    Ok(CheckpointTuple {
        config: CheckpointConfig::new(&config.thread_id, &config.namespace)
            .with_checkpoint_id(&checkpoint.id),
        checkpoint,
        parent_config,
        pending_writes,
    })
}

impl Checkpointer for SqliteCheckpointer {
    fn get_tuple(&self, config: &CheckpointConfig) -> EngineResult<Option<CheckpointTuple>> {
        let conn = self.lock()?;
        let checkpoint = match &config.checkpoint_id {
            Some(id) => conn
                .query_row(
                    "SELECT checkpoint_id, parent_id, created_at, channel_versions, metadata
                     FROM checkpoints
                     WHERE thread_id = ?1 AND namespace = ?2 AND checkpoint_id = ?3",
                    params![config.thread_id, config.namespace, id],
                    checkpoint_from_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT checkpoint_id, parent_id, created_at, channel_versions, metadata
                     FROM checkpoints
                     WHERE thread_id = ?1 AND namespace = ?2
                     ORDER BY created_at DESC, checkpoint_id DESC
                     LIMIT 1",
                    params![config.thread_id, config.namespace],
                    checkpoint_from_row,
                )
                .optional()?,
        };
        match checkpoint {
            Some(checkpoint) => Ok(Some(resolve(&conn, config, checkpoint)?)),
            None => Ok(None),
        }
    }

    fn list(
        &self,
        config: &CheckpointConfig,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> EngineResult<Vec<CheckpointTuple>> {
        let conn = self.lock()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let checkpoints: Vec<Checkpoint> = match before {
            Some(before_id) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT checkpoint_id, parent_id, created_at, channel_versions, metadata
                     FROM checkpoints
                     WHERE thread_id = ?1 AND namespace = ?2
                       AND (created_at, checkpoint_id) < (
                           SELECT created_at, checkpoint_id FROM checkpoints
                           WHERE thread_id = ?1 AND namespace = ?2 AND checkpoint_id = ?3)
                     ORDER BY created_at DESC, checkpoint_id DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![config.thread_id, config.namespace, before_id, limit],
                    checkpoint_from_row,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT checkpoint_id, parent_id, created_at, channel_versions, metadata
                     FROM checkpoints
                     WHERE thread_id = ?1 AND namespace = ?2
                     ORDER BY created_at DESC, checkpoint_id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![config.thread_id, config.namespace, limit],
                    checkpoint_from_row,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        checkpoints
            .into_iter()
            .map(|checkpoint| resolve(&conn, config, checkpoint))
            .collect()
    }

    fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        new_values: HashMap<String, TaggedValue>,
    ) -> EngineResult<CheckpointConfig> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for (channel, value) in new_values {
            let Some(version) = checkpoint.channel_versions.get(&channel).copied() else {
                return Err(EngineError::Store(format!(
                    "channel {:?} has a value but no version",
                    channel
                )));
            };
            // First write wins; a stored version is immutable.
            tx.execute(
                "INSERT OR IGNORE INTO channel_blobs
                 (thread_id, namespace, channel, version, tag, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    config.thread_id,
                    config.namespace,
                    channel,
                    version,
                    value.tag(),
                    value.payload()?,
                ],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO checkpoints
             (thread_id, namespace, checkpoint_id, parent_id, created_at, channel_versions, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                config.thread_id,
                config.namespace,
                checkpoint.id,
                checkpoint.parent_id,
                checkpoint.created_at,
                serde_json::to_string(&checkpoint.channel_versions)?,
                serde_json::to_string(&checkpoint.metadata)?,
            ],
        )?;
        tx.commit()?;

        Ok(CheckpointConfig::new(&config.thread_id, &config.namespace)
            .with_checkpoint_id(checkpoint.id))
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
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO pending_writes
                 (thread_id, namespace, checkpoint_id, task_id, idx, channel, tag, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    config.thread_id,
                    config.namespace,
                    checkpoint_id,
                    task_id,
                    idx as u64,
                    channel,
                    value.tag(),
                    value.payload()?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
