//! Graph-driven agent execution engine.
//!
//! The engine runs a compiled state graph one superstep at a time, threading
//! a versioned [`state::ExecutionState`] through the nodes, checkpointing
//! after every superstep, and streaming incremental output through a
//! batching buffer.

pub mod cancel;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod message;
pub mod model;
pub mod nodes;
pub mod plan;
pub mod retrieval;
pub mod run;
pub mod state;
pub mod status;
pub mod stream;
pub mod tool;

/// Common imports for building and running agent graphs.
pub mod prelude {
    pub use super::cancel::CancellationToken;
    pub use super::config::RunConfig;
    pub use super::constants::{END, START};
    pub use super::error::{EngineError, EngineResult};
    pub use super::event::{EventSink, NoopEventSink, StreamEvent};
    pub use super::executor::{CompiledGraph, ExecutionConfig};
    pub use super::graph::{BoxFuture, StateGraph};
    pub use super::message::{Message, MessageRole};
    pub use super::model::{ChatModel, ChatRequest, ChatResponse, StructuredSchema};
    pub use super::nodes::{agent_graph, RunContext};
    pub use super::plan::{CompletedItem, CompletedStep, Plan, PlanItem, PlanStep};
    pub use super::retrieval::{RetrievalPipeline, RetrievedDocument, Retriever, WebSearcher};
    pub use super::run::{RunOutcome, Runner};
    pub use super::state::ExecutionState;
    pub use super::status::{MemoryRunStatusStore, RunStatus, RunStatusStore, StatusRecord};
    pub use super::stream::{ChunkLog, MemoryChunkLog, SqliteChunkLog, StreamBuffer};
    pub use super::tool::{Tool, ToolCall, ToolDefinition, ToolRegistry};
}
