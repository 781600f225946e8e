//! Model invocation interface.
//!
//! The concrete provider (prompt construction, token transport) lives outside
//! the engine; this is the boundary the graph nodes program against.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::graph::BoxFuture;
use crate::engine::message::{Message, MessageRole};
use crate::engine::tool::ToolDefinition;

/// Request payload for a model call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tools the model may request; empty disables tool use for this call.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Response payload from a model call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: Message,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            model: None,
            finish_reason: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: impl Into<String>) -> Self {
        self.finish_reason = Some(finish_reason.into());
        self
    }
}

/// Schema descriptor for structured generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl StructuredSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
        }
    }
}

/// Standard interface for chat-capable models.
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Whether the model can request tool calls. Drives the pass decision.
    fn supports_tools(&self) -> bool;

    fn generate(&self, request: ChatRequest) -> BoxFuture<'_, EngineResult<ChatResponse>>;

    /// Returns a raw value the caller validates against the schema.
    fn generate_structured(
        &self,
        request: ChatRequest,
        schema: StructuredSchema,
    ) -> BoxFuture<'_, EngineResult<serde_json::Value>>;
}

/// Structured generation with one fix-up retry: on parse failure the model is
/// re-asked with a format-correction instruction; a second failure is fatal.
pub async fn generate_structured<T: DeserializeOwned>(
    model: &dyn ChatModel,
    request: ChatRequest,
    schema: StructuredSchema,
) -> EngineResult<T> {
    let value = model
        .generate_structured(request.clone(), schema.clone())
        .await?;
    match serde_json::from_value::<T>(value.clone()) {
        Ok(parsed) => Ok(parsed),
        Err(first_err) => {
            tracing::warn!(
                schema = %schema.name,
                error = %first_err,
                "structured output parse failed, retrying with fix-up instruction"
            );
            let mut retry = request;
            retry.messages.push(Message::new(
                MessageRole::System,
                format!(
                    "Your previous response did not match the required {} schema ({}). \
                     Respond again with only a valid object for that schema.",
                    schema.name, first_err
                ),
            ));
            let value = model.generate_structured(retry, schema.clone()).await?;
            serde_json::from_value::<T>(value).map_err(|err| {
                EngineError::StructuredOutput(format!(
                    "{} schema parse failed after fix-up retry: {}",
                    schema.name, err
                ))
            })
        }
    }
}

/// One scripted mock response.
#[derive(Clone, Debug)]
enum MockReply {
    Text { content: String, delay: Option<Duration> },
    Structured { value: serde_json::Value, delay: Option<Duration> },
    Full { message: Message, delay: Option<Duration> },
    Error { message: String },
}

/// Deterministic scripted model for tests. Replies are consumed in order;
/// an exhausted script yields a plain "ok" completion.
#[derive(Clone)]
pub struct MockChatModel {
    model_id: String,
    supports_tools: bool,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
}

impl MockChatModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            supports_tools: true,
            replies: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn without_tool_support(mut self) -> Self {
        self.supports_tools = false;
        self
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Text {
            content: content.into(),
            delay: None,
        });
    }

    pub fn push_text_after(&self, content: impl Into<String>, delay: Duration) {
        self.replies.lock().unwrap().push_back(MockReply::Text {
            content: content.into(),
            delay: Some(delay),
        });
    }

    /// Scripts a complete message, metadata included. Used to simulate
    /// assistant turns that request tool calls.
    pub fn push_message(&self, message: Message) {
        self.replies.lock().unwrap().push_back(MockReply::Full {
            message,
            delay: None,
        });
    }

    pub fn push_structured(&self, value: serde_json::Value) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Structured { value, delay: None });
    }

    pub fn push_structured_after(&self, value: serde_json::Value, delay: Duration) {
        self.replies.lock().unwrap().push_back(MockReply::Structured {
            value,
            delay: Some(delay),
        });
    }

    /// Scripts a failed call.
    pub fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Error {
            message: message.into(),
        });
    }

    fn pop(&self) -> Option<MockReply> {
        self.replies.lock().unwrap().pop_front()
    }
}

impl ChatModel for MockChatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    fn generate(&self, _request: ChatRequest) -> BoxFuture<'_, EngineResult<ChatResponse>> {
        let reply = self.pop();
        let model_id = self.model_id.clone();
        Box::pin(async move {
            let (message, delay) = match reply {
                Some(MockReply::Text { content, delay }) => (Message::assistant(content), delay),
                Some(MockReply::Structured { value, delay }) => {
                    (Message::assistant(value.to_string()), delay)
                }
                Some(MockReply::Full { message, delay }) => (message, delay),
                Some(MockReply::Error { message }) => {
                    return Err(EngineError::Model(message));
                }
                None => (Message::assistant("ok"), None),
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ChatResponse::new(message).with_model(model_id))
        })
    }

    fn generate_structured(
        &self,
        _request: ChatRequest,
        schema: StructuredSchema,
    ) -> BoxFuture<'_, EngineResult<serde_json::Value>> {
        let reply = self.pop();
        Box::pin(async move {
            match reply {
                Some(MockReply::Structured { value, delay }) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(value)
                }
                Some(MockReply::Text { content, .. }) => {
                    // A free-text reply where an object was required; the
                    // caller's parse will fail and trigger the fix-up path.
                    Ok(serde_json::Value::String(content))
                }
                Some(MockReply::Full { message, .. }) => {
                    Ok(serde_json::Value::String(message.content))
                }
                Some(MockReply::Error { message }) => Err(EngineError::Model(message)),
                None => Err(EngineError::Model(format!(
                    "mock script exhausted while generating {}",
                    schema.name
                ))),
            }
        })
    }
}
