//! Shared constants for graph execution and streaming.

use std::time::Duration;

/// Virtual entry node of every graph.
pub const START: &str = "__start__";

/// Virtual terminal node of every graph.
pub const END: &str = "__end__";

/// Upper bound on supersteps for a single run.
pub const MAX_SUPERSTEPS: usize = 100;

/// Upper bound on model/tool round trips inside one agent node.
pub const MAX_TOOL_ROUNDS: usize = 8;

/// Fixed interval between stream buffer flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Interval between checks of the externally mutable run status record.
pub const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-sub-task timeout for retrieval queries and grading calls.
pub const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(15);
