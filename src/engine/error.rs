//! Error taxonomy for engine execution.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by graph execution, collaborators, and the checkpoint store.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Programmer error: missing identifiers, out-of-range plan, bad wiring.
    /// Fails fast, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A node name was routed to but never registered.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node handler failed.
    #[error("execution error in node {node}: {message}")]
    Execution { node: String, message: String },

    /// A model call failed.
    #[error("model error: {0}")]
    Model(String),

    /// Structured output could not be parsed even after the fix-up retry.
    #[error("structured output error: {0}")]
    StructuredOutput(String),

    /// A tool invocation failed.
    #[error("tool error in {tool}: {message}")]
    Tool { tool: String, message: String },

    /// The run was deliberately cancelled. Not an operational fault.
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    /// The superstep loop exceeded its recursion limit.
    #[error("superstep limit exceeded")]
    SuperstepLimitExceeded,

    /// The checkpoint store failed.
    #[error("checkpoint store error: {0}")]
    Store(String),

    /// Serialization of a channel value, event, or checkpoint blob failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn execution(node: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Execution {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Aborted { .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
