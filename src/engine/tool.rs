//! Tool definitions, calls, and the registry the agent executes through.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::event::{EventSink, StreamEvent};
use crate::engine::graph::BoxFuture;

/// Declarative description of a tool, handed to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A model-requested tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// An executable tool.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn call(&self, arguments: serde_json::Value) -> BoxFuture<'_, EngineResult<serde_json::Value>>;
}

/// Named collection of tools available to one run.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions in name order, for a stable model prompt.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Runs one call, emitting the start marker before execution and the
    /// completion marker after.
    pub async fn execute(
        &self,
        call: &ToolCall,
        sink: &dyn EventSink,
    ) -> EngineResult<serde_json::Value> {
        let tool = self.get(&call.name).ok_or_else(|| EngineError::Tool {
            tool: call.name.clone(),
            message: "tool not registered".to_string(),
        })?;

        sink.emit(StreamEvent::tool_start(&call.name, call.arguments.clone()))?;
        tracing::debug!(tool = %call.name, "executing tool call");

        let output = tool
            .call(call.arguments.clone())
            .await
            .map_err(|err| EngineError::Tool {
                tool: call.name.clone(),
                message: err.to_string(),
            })?;

        sink.emit(StreamEvent::tool_end(&call.name, output.clone()))?;
        Ok(output)
    }
}
