//! Role-tagged conversation message model.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.to_ascii_lowercase().as_str() {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// One conversation turn. `metadata` carries side payloads such as the
/// past-steps trail and retrieved documents attached to a final answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
    pub created_at: String,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata: default_metadata(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.into(), value);
        }
        self
    }

    /// Whether this message is part of a tool exchange (a tool result, or an
    /// assistant message that only requested tool calls).
    pub fn is_tool_exchange(&self) -> bool {
        if self.role == MessageRole::Tool {
            return true;
        }
        self.role == MessageRole::Assistant
            && self
                .metadata
                .get("tool_calls")
                .map(|calls| !calls.as_array().map(Vec::is_empty).unwrap_or(true))
                .unwrap_or(false)
    }
}

/// Last message of the given role, scanning from the back.
pub fn last_message_of_role(messages: &[Message], role: MessageRole) -> Option<&Message> {
    messages.iter().rev().find(|message| message.role == role)
}

#[cfg(test)]
mod tests {
    use super::{last_message_of_role, Message, MessageRole};

    #[test]
    fn message_new_assigns_id_and_timestamp() {
        let message = Message::user("hi");
        assert!(!message.id.is_empty());
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.content, "hi");
        assert_eq!(message.metadata, serde_json::json!({}));
    }

    #[test]
    fn with_metadata_extends_the_object() {
        let message = Message::assistant("done")
            .with_metadata("documents", serde_json::json!([]))
            .with_metadata("past_steps", serde_json::json!([1, 2]));
        assert_eq!(message.metadata["past_steps"], serde_json::json!([1, 2]));
        assert_eq!(message.metadata["documents"], serde_json::json!([]));
    }

    #[test]
    fn tool_exchange_detection() {
        assert!(Message::tool("result").is_tool_exchange());
        assert!(!Message::assistant("plain answer").is_tool_exchange());

        let calling = Message::assistant("")
            .with_metadata("tool_calls", serde_json::json!([{ "tool": "search" }]));
        assert!(calling.is_tool_exchange());
    }

    #[test]
    fn last_message_of_role_scans_backwards() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("a"),
            Message::user("second"),
        ];
        let found = last_message_of_role(&messages, MessageRole::User).unwrap();
        assert_eq!(found.content, "second");
        assert!(last_message_of_role(&messages, MessageRole::Tool).is_none());
    }

    #[test]
    fn message_role_parse_is_case_insensitive() {
        assert_eq!(MessageRole::parse("USER"), Some(MessageRole::User));
        assert_eq!(MessageRole::parse("unknown"), None);
    }
}
