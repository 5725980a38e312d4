//! Unified Data Model
//!
//! Vendor-agnostic request/response types shared by every adapter and the
//! client orchestrator. Constructed per call and discarded at call end,
//! except where noted.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::utils::cancel::CancelHandle;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Inline image bytes with their media type.
    Image {
        data: Vec<u8>,
        media_type: String,
    },
    /// Image referenced by URL.
    ImageUrl { url: String },
}

/// Message content: plain text or an ordered part sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain-text view, when the content is text-only.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(_) => None,
        }
    }

    /// Concatenated text across all text parts, for token estimation.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    _ => 0,
                })
                .sum(),
        }
    }
}

/// A single chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    /// Assistant-issued tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Correlates a tool-role message with the call it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
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

    /// Tool-result message answering `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    /// User message with multi-part content.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Parts(parts),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }
}

/// Vendor-agnostic tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON-schema shaped parameter description.
    pub parameters: serde_json::Value,
}

impl Tool {
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

/// A tool invocation issued by the model.
///
/// Vendors that omit ids (Gemini) get a synthesized `call_<uuid>`, unique
/// within the response or stream that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Serialized JSON arguments, exactly as the vendor produced them.
    pub arguments: String,
}

/// Tool-choice policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    /// Force a specific tool by name.
    Tool(String),
}

/// Response format hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Unified per-call request options.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Provider selector; defaults to the client's configured provider.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Vendor-normalized system prompt: merged into messages or sent as a
    /// separate field depending on the adapter. Wins over system-role
    /// messages where the vendor has a dedicated field.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    /// External cancellation signal for this call.
    pub cancel: Option<CancelHandle>,
}

impl ChatOptions {
    /// Single user message with everything else defaulted.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
            ..Self::default()
        }
    }
}

/// Sugar accepted by [`crate::client::Client::chat`].
pub enum ChatInput {
    Text(String),
    Options(Box<ChatOptions>),
}

impl From<&str> for ChatInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ChatInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<ChatOptions> for ChatInput {
    fn from(o: ChatOptions) -> Self {
        Self::Options(Box::new(o))
    }
}

impl From<ChatInput> for ChatOptions {
    fn from(input: ChatInput) -> Self {
        match input {
            ChatInput::Text(s) => Self::from_text(s),
            ChatInput::Options(o) => *o,
        }
    }
}

/// Token usage as reported (or derived) per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Total defaults to input + output unless the vendor reported it.
    pub fn new(input_tokens: u32, output_tokens: u32, total: Option<u32>) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: total.unwrap_or(input_tokens + output_tokens),
        }
    }
}

/// Normalized finish reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

/// Derived latency figures for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AiLatency {
    /// Time to first token, ms. Equals `total_ms` when no token was produced.
    pub ttft_ms: u64,
    /// Tokens per second; 0 when total is 0.
    pub tps: f64,
    /// Total call duration, ms.
    pub total_ms: u64,
}

/// Per-call mutable scratch state, owned by whoever drives the call and
/// passed explicitly so concurrent calls cannot cross-contaminate timing.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub started: Instant,
    pub first_token_at: Option<Instant>,
    pub token_count: u64,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            first_token_at: None,
            token_count: 0,
        }
    }

    /// Record the first produced token. Subsequent calls are no-ops.
    pub fn mark_first_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
    }

    /// Derive latency at call completion.
    pub fn latency(&self) -> AiLatency {
        let total = self.started.elapsed();
        let total_ms = total.as_millis() as u64;
        let ttft_ms = self
            .first_token_at
            .map(|t| t.duration_since(self.started).as_millis() as u64)
            .unwrap_or(total_ms);
        let tps = if total_ms > 0 {
            self.token_count as f64 / total_ms as f64 * 1000.0
        } else {
            0.0
        };
        AiLatency {
            ttft_ms,
            tps,
            total_ms,
        }
    }
}

/// Unified non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub latency: AiLatency,
    /// Model that actually served the call (after fallback, if any).
    pub model: String,
    pub provider: String,
    /// True when served from the response cache without a network call.
    pub cached: bool,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Raw vendor payload, opaque, for debugging only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Embedding request options.
#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input: Vec<String>,
}

/// Embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub usage: Option<TokenUsage>,
}
