//! Run status records, mutable from outside the engine.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Lifecycle of one run. `Cancelled` may be written externally at any time;
/// the engine polls for it while streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Streaming,
    Cancelled,
    Error,
    Done,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Streaming => "streaming",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
            RunStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Error | RunStatus::Done
        )
    }
}

/// Stored status plus the error message for failed runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl StatusRecord {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// Shared store of run status records.
pub trait RunStatusStore: Send + Sync {
    fn get(&self, run_id: &str) -> EngineResult<Option<StatusRecord>>;
    fn set(&self, run_id: &str, record: StatusRecord) -> EngineResult<()>;
}

/// Status store backed by process memory.
#[derive(Default)]
pub struct MemoryRunStatusStore {
    records: Mutex<HashMap<String, StatusRecord>>,
}

impl MemoryRunStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStatusStore for MemoryRunStatusStore {
    fn get(&self, run_id: &str) -> EngineResult<Option<StatusRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| EngineError::Store("status store lock poisoned".to_string()))?;
        Ok(records.get(run_id).cloned())
    }

    fn set(&self, run_id: &str, record: StatusRecord) -> EngineResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| EngineError::Store("status store lock poisoned".to_string()))?;
        records.insert(run_id.to_string(), record);
        Ok(())
    }
}
