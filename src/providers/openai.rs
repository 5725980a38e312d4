//! OpenAI-shaped adapter
//!
//! Speaks the `/chat/completions` wire protocol: bearer auth, SSE streaming
//! with one JSON payload per `data:` line and a `[DONE]` sentinel.
//! Tool-call arguments arrive as indexed deltas and are accumulated into
//! complete calls for the unified `ToolCall` event.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::AiError;
use crate::providers::{classify_status, retry_after_hint, send_cancellable, ProviderAdapter};
use crate::stream::{EventStream, StreamEvent};
use crate::types::{
    AiResponse, ChatMessage, ChatOptions, ContentPart, EmbedOptions, EmbedResponse, FinishReason,
    MessageContent, MessageRole, RequestContext, TokenUsage, ToolCall, ToolChoice, ResponseFormat,
};
use crate::utils::streaming::{sse_event_stream, EventConverter};
use crate::utils::{join_url, resolve_api_key};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct OpenAiConfig {
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub default_model: Option<String>,
    pub organization: Option<String>,
}

pub struct OpenAiAdapter {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn request(&self, path: &str) -> Result<reqwest::RequestBuilder, AiError> {
        let key = resolve_api_key(self.config.api_key.as_deref(), API_KEY_ENV).ok_or_else(|| {
            AiError::Configuration(format!("openai: no API key configured and {API_KEY_ENV} unset"))
        })?;
        let mut builder = self
            .http
            .post(join_url(self.base_url(), path))
            .bearer_auth(key);
        if let Some(org) = &self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }
        Ok(builder)
    }

    /// Build the vendor chat body from unified options.
    pub(crate) fn build_request_body(&self, options: &ChatOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or_default(),
            "messages": transform_messages(options),
        });
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if let Some(stop) = &options.stop {
            body["stop"] = serde_json::json!(stop);
        }
        if let Some(tools) = &options.tools {
            body["tools"] = serde_json::Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(choice) = &options.tool_choice {
            body["tool_choice"] = match choice {
                ToolChoice::Auto => serde_json::json!("auto"),
                ToolChoice::None => serde_json::json!("none"),
                ToolChoice::Required => serde_json::json!("required"),
                ToolChoice::Tool(name) => serde_json::json!({
                    "type": "function",
                    "function": { "name": name }
                }),
            };
        }
        if let Some(ResponseFormat::Json) = options.response_format {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

/// Map unified messages to the vendor message array. An explicit system
/// prompt is merged in as a leading system-role message.
pub(crate) fn transform_messages(options: &ChatOptions) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(options.messages.len() + 1);
    if let Some(system) = &options.system_prompt {
        out.push(serde_json::json!({ "role": "system", "content": system }));
    }
    for msg in &options.messages {
        out.push(transform_message(msg));
    }
    out
}

fn transform_message(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let content = match &msg.content {
        MessageContent::Text(t) => serde_json::json!(t),
        MessageContent::Parts(parts) => serde_json::Value::Array(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => {
                        serde_json::json!({ "type": "text", "text": text })
                    }
                    ContentPart::Image { data, media_type } => {
                        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{media_type};base64,{encoded}") }
                        })
                    }
                    ContentPart::ImageUrl { url } => serde_json::json!({
                        "type": "image_url",
                        "image_url": { "url": url }
                    }),
                })
                .collect(),
        ),
    };
    let mut value = serde_json::json!({ "role": role, "content": content });
    if let Some(calls) = &msg.tool_calls {
        value["tool_calls"] = serde_json::Value::Array(
            calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments }
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = serde_json::json!(id);
    }
    if let Some(name) = &msg.name {
        value["name"] = serde_json::json!(name);
    }
    value
}

/// Classify a non-success response using the standard error envelope
/// `{ "error": { "message", "type", "code" } }`.
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
        code = err.code.map(|c| match c {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        context_length = code.as_deref() == Some("context_length_exceeded");
    }

    classify_status(PROVIDER, status, message, code, retry_after, context_length)
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[allow(dead_code)]
    r#type: Option<String>,
    code: Option<serde_json::Value>,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// Non-streaming response shape.

#[derive(Deserialize)]
struct ChatCompletion {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallPayload>>,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    id: Option<String>,
    function: FunctionPayload,
}

#[derive(Deserialize)]
struct FunctionPayload {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl UsagePayload {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.unwrap_or(0),
            self.completion_tokens.unwrap_or(0),
            self.total_tokens,
        )
    }
}

/// Parse the vendor JSON into a unified response.
pub(crate) fn parse_response(
    raw: serde_json::Value,
    options: &ChatOptions,
    ctx: &mut RequestContext,
) -> Result<AiResponse, AiError> {
    let parsed: ChatCompletion = serde_json::from_value(raw.clone())?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AiError::Parse("openai response carried no choices".into()))?;

    let usage = parsed.usage.map(UsagePayload::into_usage);
    if let Some(u) = usage {
        ctx.token_count = u64::from(u.output_tokens);
    }
    let tool_calls = choice.tool_calls_unified();

    Ok(AiResponse {
        content: choice.message.content.unwrap_or_default(),
        usage,
        latency: ctx.latency(),
        model: parsed
            .model
            .or_else(|| options.model.clone())
            .unwrap_or_default(),
        provider: PROVIDER.to_string(),
        cached: false,
        finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
        tool_calls,
        raw: Some(raw),
    })
}

impl Choice {
    fn tool_calls_unified(&self) -> Option<Vec<ToolCall>> {
        let calls = self.message.tool_calls.as_ref()?;
        let unified: Vec<ToolCall> = calls
            .iter()
            .map(|c| ToolCall {
                id: c
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                name: c.function.name.clone().unwrap_or_default(),
                arguments: c.function.arguments.clone().unwrap_or_default(),
            })
            .collect();
        (!unified.is_empty()).then_some(unified)
    }
}

// Streaming payload shape.

#[derive(Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful SSE converter: accumulates indexed tool-call deltas, defers the
/// terminal `Done` until the sentinel (or source close) so a trailing
/// usage-only chunk is not lost.
#[derive(Default)]
pub(crate) struct OpenAiEventConverter {
    pending_calls: Vec<(usize, PendingCall)>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl OpenAiEventConverter {
    fn convert_chunk(&mut self, chunk: StreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(2);

        if let Some(usage) = chunk.usage.map(UsagePayload::into_usage) {
            self.usage = Some(usage);
            events.push(StreamEvent::Usage(usage));
        }

        let Some(choice) = chunk.choices.and_then(|c| c.into_iter().next()) else {
            return events;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::Text { delta: content });
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let index = tc.index.unwrap_or(0);
                let pos = match self.pending_calls.iter().position(|(i, _)| *i == index) {
                    Some(pos) => pos,
                    None => {
                        self.pending_calls.push((index, PendingCall::default()));
                        self.pending_calls.len() - 1
                    }
                };
                let entry = &mut self.pending_calls[pos].1;
                if let Some(id) = tc.id {
                    entry.id = id;
                }
                let mut name = None;
                let mut args = String::new();
                if let Some(f) = tc.function {
                    if let Some(n) = f.name {
                        entry.name = n.clone();
                        name = Some(n);
                    }
                    if let Some(a) = f.arguments {
                        entry.arguments.push_str(&a);
                        args = a;
                    }
                }
                events.push(StreamEvent::ToolCallDelta {
                    id: entry.id.clone(),
                    name,
                    arguments_delta: args,
                });
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(map_finish_reason(reason));
            // Flush accumulated calls as complete ToolCall events.
            for (_, call) in self.pending_calls.drain(..) {
                events.push(StreamEvent::ToolCall(ToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{}", uuid::Uuid::new_v4())
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: call.arguments,
                }));
            }
        }

        events
    }
}

impl EventConverter for OpenAiEventConverter {
    fn convert_data(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => self.convert_chunk(chunk),
            Err(e) => {
                tracing::warn!("skipping undecodable openai chunk: {e}");
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
            usage: self.usage.take(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
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
        let request = self.request("chat/completions")?.json(&body);
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
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        let request = self.request("chat/completions")?.json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        Ok(sse_event_stream(response, OpenAiEventConverter::default()))
    }

    async fn embed(&self, options: &EmbedOptions) -> Result<EmbedResponse, AiError> {
        let model = options
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| AiError::Configuration("openai: no embedding model specified".into()))?;
        let body = serde_json::json!({ "model": model, "input": options.input });
        let response = self.request("embeddings")?.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        let parsed: EmbeddingsPayload = response.json().await?;
        Ok(EmbedResponse {
            embeddings: parsed.data.into_iter().map(|d| d.embedding).collect(),
            model: parsed.model.unwrap_or(model),
            usage: parsed.usage.map(UsagePayload::into_usage),
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsPayload {
    data: Vec<EmbeddingRow>,
    model: Option<String>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}
