//! A concrete `AiProvider`: OpenAI-compatible `/chat/completions`. Wiring a
//! vendor SDK is a deployment concern (§4.4 only specifies the trait), the
//! way the teacher's `create_ai_client` picks a format handler from
//! request-carried settings rather than the core owning one client.
//!
//! This adapter covers every self-hosted/OpenAI-compatible backend (Ollama's
//! `/v1/chat/completions`, vLLM, LM Studio, OpenAI itself) since `Tool`
//! schemas are already serialized in the OpenAI function-call envelope
//! (`Tool::as_function_schema`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use braindrive_core::model::{Message, MessageRole, ToolCall};
use braindrive_core::provider::{
    normalize_finish_reason, AiProvider, ChatChunk, ChatRequest, ChatStream, ProviderError, Usage,
};

pub struct OpenAiCompatibleProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            http: Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_openai).collect();
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn message_to_openai(message: &Message) -> Value {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut out = serde_json::json!({ "role": role, "content": message.content });
    if let Some(tool_call_id) = &message.tool_call_id {
        out["tool_call_id"] = serde_json::json!(tool_call_id);
    }
    if let Some(tool_calls) = &message.tool_calls {
        out["tool_calls"] = Value::Array(
            tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    out
}

#[derive(Debug, Deserialize)]
struct CompletionEnvelope {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunctionCall,
}

#[derive(Debug, Deserialize)]
struct CompletionFunctionCall {
    name: String,
    arguments: String,
}

fn into_chat_chunk(envelope: CompletionEnvelope) -> ChatChunk {
    let choice = envelope.choices.into_iter().next();
    let Some(choice) = choice else {
        return ChatChunk {
            finish_reason: Some("stop".to_string()),
            usage: envelope.usage,
            id: envelope.id,
            ..Default::default()
        };
    };

    let tool_calls = choice.message.tool_calls.map(|calls| {
        calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments)),
            })
            .collect()
    });

    ChatChunk {
        content: choice.message.content,
        role: choice.message.role,
        tool_calls,
        finish_reason: choice.finish_reason.map(|r| normalize_finish_reason(&r)),
        usage: envelope.usage,
        id: envelope.id,
    }
}

#[async_trait]
impl AiProvider for OpenAiCompatibleProvider {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatChunk, ProviderError> {
        let body = self.request_body(&request);
        let builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Upstream(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::InvalidCredentials);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream(format!("{status}: {body}")));
        }

        let envelope: CompletionEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        Ok(into_chat_chunk(envelope))
    }

    async fn chat_completion_stream(&self, _request: ChatRequest) -> Result<ChatStream, ProviderError> {
        Err(ProviderError::Upstream(
            "streaming chat completions are not wired for this provider".to_string(),
        ))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let builder = self.http.get(format!("{}/models", self.base_url));
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Upstream(format!("status {}", response.status())));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        let ids = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    async fn validate_credentials(&self) -> Result<bool, ProviderError> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(ProviderError::InvalidCredentials) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
