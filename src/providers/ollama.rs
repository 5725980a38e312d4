//! Ollama (local) adapter
//!
//! Talks to a local Ollama daemon over its native `/api/chat` protocol.
//! No authentication applies. Streaming is NDJSON, one JSON object per
//! line, with a `done: true` flag on the final line instead of an SSE
//! sentinel.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::AiError;
use crate::providers::{classify_status, send_cancellable, ProviderAdapter};
use crate::stream::{EventStream, StreamEvent};
use crate::types::{
    AiResponse, ChatMessage, ChatOptions, ContentPart, EmbedOptions, EmbedResponse, FinishReason,
    MessageContent, MessageRole, RequestContext, ResponseFormat, TokenUsage,
};
use crate::utils::join_url;
use crate::utils::streaming::{ndjson_event_stream, EventConverter};

const PROVIDER: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub default_model: Option<String>,
    /// How long the daemon keeps the model loaded after the call,
    /// e.g. `"5m"`.
    pub keep_alive: Option<String>,
}

pub struct OllamaAdapter {
    config: OllamaConfig,
    http: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(config: OllamaConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(join_url(self.base_url(), path));
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }
        builder
    }

    pub(crate) fn build_request_body(
        &self,
        options: &ChatOptions,
        stream: bool,
    ) -> Result<serde_json::Value, AiError> {
        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(options.messages.len() + 1);
        if let Some(system) = &options.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for msg in &options.messages {
            messages.push(transform_message(msg)?);
        }

        let mut body = serde_json::json!({
            "model": options.model,
            "messages": messages,
            "stream": stream,
        });

        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = options.top_p {
            opts.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(m) = options.max_tokens {
            // The daemon calls the output cap num_predict.
            opts.insert("num_predict".into(), serde_json::json!(m));
        }
        if let Some(stop) = &options.stop {
            opts.insert("stop".into(), serde_json::json!(stop));
        }
        if !opts.is_empty() {
            body["options"] = serde_json::Value::Object(opts);
        }

        if let Some(tools) = &options.tools {
            body["tools"] = serde_json::json!(tools
                .iter()
                .map(|t| serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if let Some(ResponseFormat::Json) = options.response_format {
            body["format"] = serde_json::json!("json");
        }
        if let Some(keep_alive) = &self.config.keep_alive {
            body["keep_alive"] = serde_json::json!(keep_alive);
        }

        Ok(body)
    }
}

fn transform_message(msg: &ChatMessage) -> Result<serde_json::Value, AiError> {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };

    let (content, images) = split_content(&msg.content)?;
    let mut value = serde_json::json!({ "role": role, "content": content });
    if !images.is_empty() {
        value["images"] = serde_json::json!(images);
    }
    if let Some(calls) = &msg.tool_calls {
        value["tool_calls"] = serde_json::json!(calls
            .iter()
            .map(|c| serde_json::json!({
                "function": {
                    "name": c.name,
                    "arguments": serde_json::from_str::<serde_json::Value>(&c.arguments)
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                }
            }))
            .collect::<Vec<_>>());
    }
    Ok(value)
}

/// The daemon takes text and images as separate fields; images are raw
/// base64 with no data-URI wrapper. It never fetches remote content, so
/// URL image parts are rejected up front instead of failing vendor-side.
fn split_content(content: &MessageContent) -> Result<(String, Vec<String>), AiError> {
    match content {
        MessageContent::Text(t) => Ok((t.clone(), vec![])),
        MessageContent::Parts(parts) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text: t } => text.push_str(t),
                    ContentPart::Image { data, .. } => {
                        images.push(base64::engine::general_purpose::STANDARD.encode(data));
                    }
                    ContentPart::ImageUrl { .. } => {
                        return Err(AiError::Unsupported(
                            "ollama does not fetch image URLs; supply inline image bytes".into(),
                        ));
                    }
                }
            }
            Ok((text, images))
        }
    }
}

/// Failures come back as `{ "error": "..." }` with a plain HTTP status.
pub(crate) fn classify_http_error(status: u16, body: &str) -> AiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
    }
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_else(|| body.to_string());
    let context_length = status == 400 && message.to_lowercase().contains("context");
    classify_status(PROVIDER, status, message, None, None, context_length)
}

#[derive(Deserialize)]
struct ChatPayload {
    model: Option<String>,
    message: Option<PayloadMessage>,
    done: Option<bool>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct PayloadMessage {
    content: Option<String>,
    tool_calls: Option<Vec<PayloadToolCall>>,
}

#[derive(Deserialize)]
struct PayloadToolCall {
    function: PayloadFunction,
}

#[derive(Deserialize)]
struct PayloadFunction {
    name: String,
    arguments: Option<serde_json::Value>,
}

impl ChatPayload {
    fn usage(&self) -> Option<TokenUsage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (input, output) => Some(TokenUsage::new(
                input.unwrap_or(0),
                output.unwrap_or(0),
                None,
            )),
        }
    }

    fn finish_reason(&self, has_tool_calls: bool) -> Option<FinishReason> {
        if has_tool_calls {
            return Some(FinishReason::ToolCalls);
        }
        self.done_reason.as_deref().map(|r| match r {
            "length" => FinishReason::Length,
            _ => FinishReason::Stop,
        })
    }
}

fn payload_tool_calls(message: Option<&PayloadMessage>) -> Vec<crate::types::ToolCall> {
    message
        .and_then(|m| m.tool_calls.as_deref())
        .unwrap_or_default()
        .iter()
        .map(|c| crate::types::ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: c.function.name.clone(),
            arguments: c
                .function
                .arguments
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Converter for the NDJSON stream: every non-final line carries a content
/// delta; the final line (`done: true`) carries the eval counts and the
/// done reason.
#[derive(Default)]
pub(crate) struct OllamaEventConverter {
    finished: bool,
}

impl EventConverter for OllamaEventConverter {
    fn convert_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let payload: ChatPayload = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("skipping undecodable ollama line: {e}");
                return vec![];
            }
        };

        let mut events = Vec::with_capacity(2);
        let tool_calls = payload_tool_calls(payload.message.as_ref());
        if let Some(content) = payload
            .message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .filter(|c| !c.is_empty())
        {
            events.push(StreamEvent::Text {
                delta: content.to_string(),
            });
        }
        let has_tools = !tool_calls.is_empty();
        for call in tool_calls {
            events.push(StreamEvent::ToolCall(call));
        }

        if payload.done == Some(true) {
            if let Some(usage) = payload.usage() {
                events.push(StreamEvent::Usage(usage));
            }
            self.finished = true;
            events.push(StreamEvent::Done {
                finish_reason: payload.finish_reason(has_tools),
                usage: payload.usage(),
            });
        }
        events
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(StreamEvent::Done {
            finish_reason: None,
            usage: None,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
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
        let body = self.build_request_body(options, false)?;
        let request = self.request("api/chat").json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text));
        }

        let raw: serde_json::Value = response.json().await?;
        let payload: ChatPayload = serde_json::from_value(raw.clone())?;

        let usage = payload.usage();
        if let Some(u) = usage {
            ctx.token_count = u64::from(u.output_tokens);
        }
        let tool_calls = payload_tool_calls(payload.message.as_ref());
        let has_tools = !tool_calls.is_empty();

        Ok(AiResponse {
            content: payload
                .message
                .as_ref()
                .and_then(|m| m.content.clone())
                .unwrap_or_default(),
            usage,
            latency: ctx.latency(),
            model: payload
                .model
                .clone()
                .or_else(|| options.model.clone())
                .unwrap_or_default(),
            provider: PROVIDER.to_string(),
            cached: false,
            finish_reason: payload.finish_reason(has_tools),
            tool_calls: has_tools.then_some(tool_calls),
            raw: Some(raw),
        })
    }

    async fn stream(&self, options: &ChatOptions) -> Result<EventStream, AiError> {
        let body = self.build_request_body(options, true)?;
        let request = self.request("api/chat").json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text));
        }

        Ok(ndjson_event_stream(response, OllamaEventConverter::default()))
    }

    async fn embed(&self, options: &EmbedOptions) -> Result<EmbedResponse, AiError> {
        let model = options
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| AiError::Configuration("ollama: no embedding model specified".into()))?;
        let mut body = serde_json::json!({
            "model": model,
            "input": options.input,
        });
        if let Some(keep_alive) = &self.config.keep_alive {
            body["keep_alive"] = serde_json::json!(keep_alive);
        }

        let response = self.request("api/embed").json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text));
        }

        #[derive(Deserialize)]
        struct EmbedPayload {
            embeddings: Vec<Vec<f32>>,
            prompt_eval_count: Option<u32>,
        }
        let parsed: EmbedPayload = response.json().await?;
        Ok(EmbedResponse {
            embeddings: parsed.embeddings,
            model,
            usage: parsed
                .prompt_eval_count
                .map(|n| TokenUsage::new(n, 0, None)),
        })
    }
}
