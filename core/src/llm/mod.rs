//! Language-model chat contract
//!
//! A single chat call over role-tagged messages, returning either a whole
//! response or a server-sent-event stream. Failures are classified for the
//! caller; the rest of the runtime treats the model as an opaque oracle and
//! degrades to safe defaults when it is unavailable.

pub mod client;

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use client::HttpChatModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            max_tokens: None,
            stream: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Rough input size estimate: 4 chars per token
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| m.content.len())
            .chain(self.system.as_ref().map(|s| s.len()))
            .sum();
        (chars as u64).div_ceil(4)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Legacy field some providers still emit instead of `content`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The response body, whichever field the provider used
    pub fn content(&self) -> String {
        self.content
            .clone()
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }
}

/// One frame of a streaming response
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    ToolUse(Value),
    Done,
}

/// Classified model failure, per the provider contract
#[derive(Error, Debug, Clone)]
pub enum LlmFailure {
    #[error("model server unreachable: {message}")]
    ServerDown { message: String },

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider error {status}: {message}")]
    ProviderError { status: u16, message: String },

    #[error("model request timed out")]
    Timeout,
}

impl LlmFailure {
    /// Classify a non-2xx HTTP status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            502 | 503 | 504 => Self::ServerDown { message },
            408 => Self::Timeout,
            _ => Self::ProviderError { status, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServerDown { .. } | Self::RateLimited { .. } | Self::Timeout => true,
            Self::ProviderError { status, .. } => matches!(status, 500..=599),
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => {
                Some(retry_after.unwrap_or(Duration::from_secs(5)))
            }
            Self::ServerDown { .. } => Some(Duration::from_secs(2)),
            Self::Timeout => Some(Duration::from_secs(1)),
            Self::ProviderError { .. } => None,
        }
    }
}

/// The chat seam the runtime depends on
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmFailure>;
}

/// Deterministic model for tests and offline runs. Scripted replies are
/// served in order; once exhausted it echoes the last user message.
#[derive(Default)]
pub struct StubModel {
    replies: Mutex<VecDeque<String>>,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(reply.into());
    }
}

#[async_trait::async_trait]
impl ChatModel for StubModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmFailure> {
        let reply = self.replies.lock().pop_front().unwrap_or_else(|| {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("");
            format!("echo: {last}")
        });

        Ok(ChatResponse {
            content: Some(reply),
            text: None,
            usage: Some(Usage {
                prompt_tokens: request.estimated_tokens() as u32,
                completion_tokens: 16,
                total_tokens: request.estimated_tokens() as u32 + 16,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_text_field() {
        let response = ChatResponse {
            content: None,
            text: Some("older provider".to_string()),
            usage: None,
        };
        assert_eq!(response.content(), "older provider");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LlmFailure::from_status(429, String::new()),
            LlmFailure::RateLimited { .. }
        ));
        assert!(matches!(
            LlmFailure::from_status(503, String::new()),
            LlmFailure::ServerDown { .. }
        ));
        assert!(matches!(
            LlmFailure::from_status(400, String::new()),
            LlmFailure::ProviderError { status: 400, .. }
        ));
        assert!(!LlmFailure::from_status(400, String::new()).is_retryable());
    }

    #[tokio::test]
    async fn test_stub_scripted_then_echo() {
        let stub = StubModel::scripted(["first"]);
        let request = ChatRequest::new("stub", vec![ChatMessage::user("hello")]);

        assert_eq!(stub.chat(&request).await.unwrap().content(), "first");
        assert_eq!(stub.chat(&request).await.unwrap().content(), "echo: hello");
    }
}
