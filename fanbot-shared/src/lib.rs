pub mod utf8;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use utf8::Utf8Decoder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Request from client to relay, shared by the synchronous and streaming endpoints.
///
/// `messages` wins over `message` when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

impl ClientChatRequest {
    /// Reads each field independently. A field of the wrong shape (a
    /// non-string `message`, a `messages` entry with an unknown role, ...)
    /// becomes `None` and leaves the other fields intact.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let messages = value
            .get("messages")
            .and_then(|m| Vec::<ChatMessage>::deserialize(m).ok());
        Self {
            message: text("message"),
            context: text("context"),
            messages,
        }
    }
}

/// Body of the synchronous endpoint. `meta` is only present on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ReplyMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMeta {
    pub elapsed_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub ok: bool,
    pub time: String,
    pub ollama_host: String,
    pub model: String,
}
