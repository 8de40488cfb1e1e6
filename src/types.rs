use crate::error::{StageFault, StageResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }
}

/// One chat message, serialized as `{"role": "...", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(Role::Ai, content)
    }

    pub fn to_value(&self) -> Value {
        json!({"role": self.role.as_str(), "content": self.content})
    }
}

const MESSAGES: &str = "a message list, a message or a string";

/// Read the conversation a model stage was handed.
///
/// Accepts an array of messages, a single message object, or a bare string
/// (taken as one human message).
pub fn messages_from_value(value: &Value) -> StageResult<Vec<Message>> {
    match value {
        Value::String(text) => Ok(vec![Message::human(text.clone())]),
        Value::Object(_) => Ok(vec![message_from_value(value)?]),
        Value::Array(items) => items.iter().map(message_from_value).collect(),
        other => Err(StageFault::input(MESSAGES, other)),
    }
}

fn message_from_value(value: &Value) -> StageResult<Message> {
    Message::deserialize(value).map_err(|_| StageFault::input(MESSAGES, value))
}

/// Text carried by a model response: a message's content or a bare string.
pub fn text_from_value(value: &Value) -> StageResult<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Object(map) => match map.get("content") {
            Some(Value::String(content)) => Ok(content.clone()),
            _ => Err(StageFault::input("a message or a string", value)),
        },
        other => Err(StageFault::input("a message or a string", other)),
    }
}
