//! Canonical chat request/response normalization across AI providers (§4.4).
//!
//! The core never talks to a specific vendor SDK. It depends on the
//! `AiProvider` trait; callers supply an adapter per provider (OpenAI,
//! Anthropic, Google, Ollama, ...), each translating to/from these canonical
//! shapes, matching the teacher's per-provider routing in `ai::providers`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Message, ToolCall};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// A canonical chat request: provider-agnostic messages, model name, and
/// optional tool schemas to offer the model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub params: ChatParams,
    pub tools: Vec<Value>,
}

/// One normalized chunk — a full batch response is modeled as a single
/// terminal chunk with `finish_reason` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// `length | max_tokens | token_limit` collapse to `length`;
/// `stop | eos | end_turn` collapse to `stop`; anything else passes through
/// lowercased.
pub fn normalize_finish_reason(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "length" | "max_tokens" | "token_limit" => "length".to_string(),
        "stop" | "eos" | "end_turn" => "stop".to_string(),
        other => other.to_string(),
    }
}

pub type ChatStream = std::pin::Pin<Box<dyn futures::Stream<Item = ChatChunk> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider returned an error: {0}")]
    Upstream(String),
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Capability set a provider integration exposes to the `ToolLoop`.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatChunk, ProviderError>;

    async fn chat_completion_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError>;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    async fn validate_credentials(&self) -> Result<bool, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_length_family() {
        assert_eq!(normalize_finish_reason("max_tokens"), "length");
        assert_eq!(normalize_finish_reason("TOKEN_LIMIT"), "length");
    }

    #[test]
    fn normalizes_stop_family() {
        assert_eq!(normalize_finish_reason("end_turn"), "stop");
        assert_eq!(normalize_finish_reason("EOS"), "stop");
    }

    #[test]
    fn passes_through_unknown_lowercased() {
        assert_eq!(normalize_finish_reason("Content_Filter"), "content_filter");
    }
}
