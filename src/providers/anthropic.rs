//! Anthropic-shaped adapter
//!
//! Speaks the `/v1/messages` wire protocol: `x-api-key` + `anthropic-version`
//! headers, named multi-field SSE events. Tool-use arguments arrive as
//! `input_json_delta` partial JSON and are accumulated until
//! `content_block_stop` closes the block.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::AiError;
use crate::providers::{classify_status, retry_after_hint, send_cancellable, ProviderAdapter};
use crate::stream::{EventStream, StreamEvent};
use crate::types::{
    AiResponse, ChatMessage, ChatOptions, ContentPart, FinishReason, MessageContent, MessageRole,
    RequestContext, TokenUsage, ToolCall, ToolChoice,
};
use crate::utils::streaming::{sse_event_stream, EventConverter};
use crate::utils::{join_url, resolve_api_key};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const DEFAULT_VERSION: &str = "2023-06-01";

/// The wire requires max_tokens; applied when the caller leaves it unset.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct AnthropicConfig {
    /// Falls back to `ANTHROPIC_API_KEY` when unset.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub default_model: Option<String>,
    /// `anthropic-version` header value.
    pub version: Option<String>,
}

pub struct AnthropicAdapter {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn request(&self) -> Result<reqwest::RequestBuilder, AiError> {
        let key = resolve_api_key(self.config.api_key.as_deref(), API_KEY_ENV).ok_or_else(|| {
            AiError::Configuration(format!(
                "anthropic: no API key configured and {API_KEY_ENV} unset"
            ))
        })?;
        let mut builder = self
            .http
            .post(join_url(self.base_url(), "/v1/messages"))
            .header("x-api-key", key)
            .header(
                "anthropic-version",
                self.config.version.as_deref().unwrap_or(DEFAULT_VERSION),
            );
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }
        Ok(builder)
    }

    /// Build the vendor chat body. System content goes in the top-level
    /// `system` field; the messages array never carries system-role entries.
    /// An explicit `system_prompt` wins over system-role messages.
    pub(crate) fn build_request_body(&self, options: &ChatOptions) -> serde_json::Value {
        let system = options.system_prompt.clone().or_else(|| {
            let hoisted: Vec<&str> = options
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::System)
                .filter_map(|m| m.content.as_text())
                .collect();
            (!hoisted.is_empty()).then(|| hoisted.join("\n"))
        });

        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or_default(),
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": transform_messages(&options.messages),
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(stop) = &options.stop {
            body["stop_sequences"] = serde_json::json!(stop);
        }
        if let Some(tools) = &options.tools {
            body["tools"] = serde_json::Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if let Some(choice) = &options.tool_choice {
            body["tool_choice"] = match choice {
                ToolChoice::Auto | ToolChoice::None => serde_json::json!({ "type": "auto" }),
                ToolChoice::Required => serde_json::json!({ "type": "any" }),
                ToolChoice::Tool(name) => serde_json::json!({ "type": "tool", "name": name }),
            };
        }
        body
    }
}

/// Map unified messages to the vendor array, excluding system entries.
pub(crate) fn transform_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(transform_message)
        .collect()
}

fn transform_message(msg: &ChatMessage) -> serde_json::Value {
    match msg.role {
        // Tool results ride as user-role tool_result blocks.
        MessageRole::Tool => serde_json::json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                "content": msg.content.as_text().unwrap_or_default(),
            }]
        }),
        MessageRole::Assistant if msg.tool_calls.is_some() => {
            let mut blocks = Vec::new();
            if let Some(text) = msg.content.as_text().filter(|t| !t.is_empty()) {
                blocks.push(serde_json::json!({ "type": "text", "text": text }));
            }
            for call in msg.tool_calls.as_deref().unwrap_or_default() {
                let input: serde_json::Value = serde_json::from_str(&call.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                blocks.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": input,
                }));
            }
            serde_json::json!({ "role": "assistant", "content": blocks })
        }
        role => {
            let role = if role == MessageRole::Assistant { "assistant" } else { "user" };
            serde_json::json!({ "role": role, "content": content_blocks(&msg.content) })
        }
    }
}

fn content_blocks(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(t) => serde_json::json!(t),
        MessageContent::Parts(parts) => serde_json::Value::Array(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => {
                        serde_json::json!({ "type": "text", "text": text })
                    }
                    ContentPart::Image { data, media_type } => serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(data),
                        }
                    }),
                    ContentPart::ImageUrl { url } => serde_json::json!({
                        "type": "image",
                        "source": { "type": "url", "url": url }
                    }),
                })
                .collect(),
        ),
    }
}

/// Classify a non-success response using the vendor envelope
/// `{ "type": "error", "error": { "type", "message" } }`.
pub(crate) fn classify_http_error(
    status: u16,
    body: &str,
    retry_after: Option<std::time::Duration>,
) -> AiError {
    let mut message = body.to_string();
    let mut code = None;
    let mut context_length = false;

    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body)
        && let Some(err) = envelope.error
    {
        if let Some(m) = err.message {
            message = m;
        }
        code = err.r#type;
        // No dedicated code exists; overflow reports as an
        // invalid_request_error mentioning tokens or context.
        let lower = message.to_lowercase();
        context_length = code.as_deref() == Some("context_length")
            || (status == 400 && (lower.contains("token") || lower.contains("context")));
    }

    classify_status(PROVIDER, status, message, code, retry_after, context_length)
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    r#type: Option<String>,
    message: Option<String>,
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        _ => FinishReason::Stop, // end_turn, stop_sequence
    }
}

// Non-streaming response shape.

#[derive(Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone, Copy)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl UsagePayload {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens.unwrap_or(0),
            self.output_tokens.unwrap_or(0),
            None,
        )
    }
}

pub(crate) fn parse_response(
    raw: serde_json::Value,
    options: &ChatOptions,
    ctx: &mut RequestContext,
) -> Result<AiResponse, AiError> {
    let parsed: MessagesResponse = serde_json::from_value(raw.clone())?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in &parsed.content {
        match block.r#type.as_str() {
            "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
            "tool_use" => tool_calls.push(ToolCall {
                id: block
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                name: block.name.clone().unwrap_or_default(),
                arguments: block
                    .input
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            }),
            _ => {}
        }
    }

    let usage = parsed.usage.map(UsagePayload::into_usage);
    if let Some(u) = usage {
        ctx.token_count = u64::from(u.output_tokens);
    }

    Ok(AiResponse {
        content,
        usage,
        latency: ctx.latency(),
        model: parsed
            .model
            .or_else(|| options.model.clone())
            .unwrap_or_default(),
        provider: PROVIDER.to_string(),
        cached: false,
        finish_reason: parsed.stop_reason.as_deref().map(map_stop_reason),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        raw: Some(raw),
    })
}

// Streaming event shape. One discriminated payload per SSE event; the
// event-name field is redundant with `type`, so only `data` is parsed.

#[derive(Deserialize)]
struct StreamPayload {
    r#type: String,
    message: Option<StreamMessage>,
    content_block: Option<StreamContentBlock>,
    delta: Option<StreamDelta>,
    usage: Option<UsagePayload>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct StreamMessage {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct StreamContentBlock {
    r#type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    r#type: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

/// Open tool-use accumulator: id, name, and the growing argument buffer.
struct ToolUseAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful converter for the named multi-field protocol.
#[derive(Default)]
pub(crate) struct AnthropicEventConverter {
    accumulator: Option<ToolUseAccumulator>,
    input_tokens: u32,
    finish_reason: Option<FinishReason>,
    last_usage: Option<TokenUsage>,
    finished: bool,
}

impl AnthropicEventConverter {
    fn convert_payload(&mut self, payload: StreamPayload) -> Vec<StreamEvent> {
        match payload.r#type.as_str() {
            "message_start" => {
                if let Some(usage) = payload.message.and_then(|m| m.usage) {
                    self.input_tokens = usage.input_tokens.unwrap_or(0);
                }
                vec![]
            }
            "content_block_start" => {
                if let Some(block) = payload.content_block
                    && block.r#type == "tool_use"
                {
                    self.accumulator = Some(ToolUseAccumulator {
                        id: block
                            .id
                            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                        name: block.name.unwrap_or_default(),
                        arguments: String::new(),
                    });
                }
                vec![]
            }
            "content_block_delta" => {
                let Some(delta) = payload.delta else { return vec![] };
                match delta.r#type.as_deref() {
                    Some("input_json_delta") => {
                        let partial = delta.partial_json.unwrap_or_default();
                        if let Some(acc) = self.accumulator.as_mut() {
                            acc.arguments.push_str(&partial);
                            vec![StreamEvent::ToolCallDelta {
                                id: acc.id.clone(),
                                name: Some(acc.name.clone()),
                                arguments_delta: partial,
                            }]
                        } else {
                            vec![]
                        }
                    }
                    _ => delta
                        .text
                        .filter(|t| !t.is_empty())
                        .map(|delta| vec![StreamEvent::Text { delta }])
                        .unwrap_or_default(),
                }
            }
            "content_block_stop" => match self.accumulator.take() {
                Some(acc) => vec![StreamEvent::ToolCall(ToolCall {
                    id: acc.id,
                    name: acc.name,
                    arguments: acc.arguments,
                })],
                None => vec![],
            },
            "message_delta" => {
                let mut events = Vec::with_capacity(2);
                if let Some(usage) = payload.usage {
                    let unified = TokenUsage::new(
                        self.input_tokens,
                        usage.output_tokens.unwrap_or(0),
                        None,
                    );
                    self.last_usage = Some(unified);
                    events.push(StreamEvent::Usage(unified));
                }
                if let Some(reason) = payload.delta.and_then(|d| d.stop_reason) {
                    self.finish_reason = Some(map_stop_reason(&reason));
                    self.finished = true;
                    events.push(StreamEvent::Done {
                        finish_reason: self.finish_reason,
                        usage: self.last_usage,
                    });
                }
                events
            }
            "message_stop" => {
                if self.finished {
                    return vec![];
                }
                self.finished = true;
                vec![StreamEvent::Done {
                    finish_reason: Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
                    usage: self.last_usage,
                }]
            }
            "error" => {
                let message = payload
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "unknown stream error".into());
                self.finished = true;
                vec![StreamEvent::Error(AiError::Api {
                    provider: PROVIDER.to_string(),
                    status: 0,
                    code: None,
                    message,
                })]
            }
            // ping keep-alives and unknown events produce nothing.
            _ => vec![],
        }
    }
}

impl EventConverter for AnthropicEventConverter {
    fn convert_data(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<StreamPayload>(data) {
            Ok(payload) => self.convert_payload(payload),
            Err(e) => {
                tracing::warn!("skipping undecodable anthropic event: {e}");
                vec![]
            }
        }
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(StreamEvent::Done {
            finish_reason: self.finish_reason.take(),
            usage: self.last_usage.take(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &'static str {
        PROVIDER
    }

    fn default_model(&self) -> Option<&str> {
        self.config.default_model.as_deref()
    }

    async fn chat(
        &self,
        options: &ChatOptions,
        ctx: &mut RequestContext,
    ) -> Result<AiResponse, AiError> {
        let body = self.build_request_body(options);
        let request = self.request()?.json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        let raw: serde_json::Value = response.json().await?;
        parse_response(raw, options, ctx)
    }

    async fn stream(&self, options: &ChatOptions) -> Result<EventStream, AiError> {
        let mut body = self.build_request_body(options);
        body["stream"] = serde_json::Value::Bool(true);

        let request = self.request()?.json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        Ok(sse_event_stream(response, AnthropicEventConverter::default()))
    }

    // No embeddings endpoint; the default `embed` rejects with Unsupported.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_system_prompt_wins_and_system_messages_are_excluded() {
        let adapter = AnthropicAdapter::new(AnthropicConfig::default(), reqwest::Client::new());
        let options = ChatOptions {
            model: Some("claude-test".into()),
            system_prompt: Some("explicit prompt".into()),
            messages: vec![ChatMessage::system("ignored"), ChatMessage::user("hi")],
            ..Default::default()
        };
        let body = adapter.build_request_body(&options);
        assert_eq!(body["system"], "explicit prompt");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn system_messages_hoist_into_system_field_when_no_prompt() {
        let adapter = AnthropicAdapter::new(AnthropicConfig::default(), reqwest::Client::new());
        let options = ChatOptions {
            model: Some("claude-test".into()),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            ..Default::default()
        };
        let body = adapter.build_request_body(&options);
        assert_eq!(body["system"], "be brief");
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let adapter = AnthropicAdapter::new(AnthropicConfig::default(), reqwest::Client::new());
        let body = adapter.build_request_body(&ChatOptions::from_text("hi"));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_use_accumulator_state_machine() {
        let mut conv = AnthropicEventConverter::default();
        assert!(conv
            .convert_data(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather"}}"#)
            .is_empty());

        let delta = conv.convert_data(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
        );
        match delta.first() {
            Some(StreamEvent::ToolCallDelta { id, arguments_delta, .. }) => {
                assert_eq!(id, "toolu_1");
                assert_eq!(arguments_delta, "{\"city\":");
            }
            other => panic!("expected delta, got {other:?}"),
        }

        conv.convert_data(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"SF\"}"}}"#,
        );
        let stop = conv.convert_data(r#"{"type":"content_block_stop","index":1}"#);
        match stop.first() {
            Some(StreamEvent::ToolCall(call)) => {
                assert_eq!(call.arguments, r#"{"city":"SF"}"#);
                assert_eq!(call.name, "get_weather");
            }
            other => panic!("expected complete tool call, got {other:?}"),
        }
        // Accumulator cleared; a stray stop emits nothing.
        assert!(conv.convert_data(r#"{"type":"content_block_stop","index":1}"#).is_empty());
    }

    #[test]
    fn message_delta_surfaces_usage_then_done() {
        let mut conv = AnthropicEventConverter::default();
        conv.convert_data(r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#);
        let events = conv.convert_data(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Usage(u) if u.total_tokens == 19));
        assert!(matches!(
            events[1],
            StreamEvent::Done { finish_reason: Some(FinishReason::Stop), .. }
        ));
        // message_stop after an explicit Done is suppressed.
        assert!(conv.convert_data(r#"{"type":"message_stop"}"#).is_empty());
    }

    #[test]
    fn ping_produces_no_event() {
        let mut conv = AnthropicEventConverter::default();
        assert!(conv.convert_data(r#"{"type":"ping"}"#).is_empty());
    }

    #[test]
    fn context_overflow_message_classifies_as_context_length() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt is too long: 210000 tokens > 200000 maximum"}}"#;
        let err = classify_http_error(400, body, None);
        assert!(matches!(err, AiError::ContextLength { .. }));
    }

    #[test]
    fn overloaded_529_classifies_as_overloaded() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = classify_http_error(529, body, None);
        assert!(matches!(err, AiError::Overloaded { .. }));
        assert!(err.is_retryable());
    }
}
