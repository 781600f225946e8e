//! Streaming event protocol emitted to the caller/UI.

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineResult;

/// Incremental output events. Exactly two wire shapes: model output deltas
/// and tool lifecycle markers (one at start with the input, one at end with
/// the output).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Ai {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    Tool {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(rename = "isComplete")]
        is_complete: bool,
    },
}

impl StreamEvent {
    pub fn ai(content: impl Into<String>) -> Self {
        StreamEvent::Ai {
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn ai_with_reasoning(content: impl Into<String>, reasoning: impl Into<String>) -> Self {
        StreamEvent::Ai {
            content: content.into(),
            reasoning: Some(reasoning.into()),
        }
    }

    pub fn tool_start(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        StreamEvent::Tool {
            tool_name: tool_name.into(),
            input: Some(input),
            output: None,
            is_complete: false,
        }
    }

    pub fn tool_end(tool_name: impl Into<String>, output: serde_json::Value) -> Self {
        StreamEvent::Tool {
            tool_name: tool_name.into(),
            input: None,
            output: Some(output),
            is_complete: true,
        }
    }
}

/// Sink for streaming events to the stream buffer, a CLI, tests, etc.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent) -> EngineResult<()>;
}

/// A no-op sink for silent execution.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: StreamEvent) -> EngineResult<()> {
        Ok(())
    }
}

/// Collects events in memory; used by tests.
#[derive(Default)]
pub struct CollectingEventSink {
    events: std::sync::Mutex<Vec<StreamEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: StreamEvent) -> EngineResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
