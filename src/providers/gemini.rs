//! Google-shaped (Gemini) adapter
//!
//! Speaks the `generateContent` wire protocol with key-in-query auth. The
//! streaming endpoint is asked for SSE explicitly (`alt=sse`), which makes
//! it speak the generic single-JSON-per-event protocol. Each payload may
//! carry a full candidate rather than a delta. The vendor issues no
//! tool-call ids, so one is synthesized per emitted call.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::AiError;
use crate::providers::{classify_status, retry_after_hint, send_cancellable, ProviderAdapter};
use crate::stream::{EventStream, StreamEvent};
use crate::types::{
    AiResponse, ChatMessage, ChatOptions, ContentPart, EmbedOptions, EmbedResponse, FinishReason,
    MessageContent, MessageRole, RequestContext, ResponseFormat, TokenUsage, ToolCall, ToolChoice,
};
use crate::utils::streaming::{sse_event_stream, EventConverter};
use crate::utils::resolve_api_key;

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Gemini adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct GeminiConfig {
    /// Falls back to `GEMINI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub default_model: Option<String>,
}

pub struct GeminiAdapter {
    config: GeminiConfig,
    http: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: GeminiConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn api_key(&self) -> Result<String, AiError> {
        resolve_api_key(self.config.api_key.as_deref(), API_KEY_ENV).ok_or_else(|| {
            AiError::Configuration(format!("gemini: no API key configured and {API_KEY_ENV} unset"))
        })
    }

    fn request(&self, model: &str, verb: &str, sse: bool) -> Result<reqwest::RequestBuilder, AiError> {
        let key = self.api_key()?;
        let mut url = format!(
            "{}/models/{}:{}?key={}",
            self.base_url().trim_end_matches('/'),
            model,
            verb,
            key
        );
        if sse {
            url.push_str("&alt=sse");
        }
        let mut builder = self.http.post(url);
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }
        Ok(builder)
    }

    /// Build the vendor chat body. System content rides in
    /// `systemInstruction`; an explicit prompt wins over system messages.
    pub(crate) fn build_request_body(&self, options: &ChatOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "contents": transform_messages(&options.messages),
        });

        let system = options.system_prompt.clone().or_else(|| {
            let hoisted: Vec<&str> = options
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::System)
                .filter_map(|m| m.content.as_text())
                .collect();
            (!hoisted.is_empty()).then(|| hoisted.join("\n"))
        });
        if let Some(system) = system {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }

        let mut generation = serde_json::Map::new();
        if let Some(t) = options.temperature {
            generation.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = options.top_p {
            generation.insert("topP".into(), serde_json::json!(p));
        }
        if let Some(m) = options.max_tokens {
            generation.insert("maxOutputTokens".into(), serde_json::json!(m));
        }
        if let Some(stop) = &options.stop {
            generation.insert("stopSequences".into(), serde_json::json!(stop));
        }
        if let Some(ResponseFormat::Json) = options.response_format {
            generation.insert("responseMimeType".into(), serde_json::json!("application/json"));
        }
        if !generation.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation);
        }

        if let Some(tools) = &options.tools {
            body["tools"] = serde_json::json!([{
                "functionDeclarations": tools
                    .iter()
                    .map(|t| serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }))
                    .collect::<Vec<_>>()
            }]);
        }
        if let Some(choice) = &options.tool_choice {
            let config = match choice {
                ToolChoice::Auto => serde_json::json!({ "mode": "AUTO" }),
                ToolChoice::None => serde_json::json!({ "mode": "NONE" }),
                ToolChoice::Required => serde_json::json!({ "mode": "ANY" }),
                ToolChoice::Tool(name) => serde_json::json!({
                    "mode": "ANY",
                    "allowedFunctionNames": [name]
                }),
            };
            body["toolConfig"] = serde_json::json!({ "functionCallingConfig": config });
        }

        body
    }
}

/// Map unified messages to the vendor `contents` array; system entries are
/// hoisted separately.
pub(crate) fn transform_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|msg| match msg.role {
            MessageRole::Tool => serde_json::json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": msg.name.as_deref().unwrap_or_default(),
                        "response": serde_json::from_str::<serde_json::Value>(
                            msg.content.as_text().unwrap_or_default()
                        ).unwrap_or_else(|_| serde_json::json!({
                            "result": msg.content.as_text().unwrap_or_default()
                        })),
                    }
                }]
            }),
            MessageRole::Assistant if msg.tool_calls.is_some() => {
                let mut parts = Vec::new();
                if let Some(text) = msg.content.as_text().filter(|t| !t.is_empty()) {
                    parts.push(serde_json::json!({ "text": text }));
                }
                for call in msg.tool_calls.as_deref().unwrap_or_default() {
                    parts.push(serde_json::json!({
                        "functionCall": {
                            "name": call.name,
                            "args": serde_json::from_str::<serde_json::Value>(&call.arguments)
                                .unwrap_or(serde_json::Value::Object(Default::default())),
                        }
                    }));
                }
                serde_json::json!({ "role": "model", "parts": parts })
            }
            role => serde_json::json!({
                "role": if role == MessageRole::Assistant { "model" } else { "user" },
                "parts": content_parts(&msg.content),
            }),
        })
        .collect()
}

fn content_parts(content: &MessageContent) -> Vec<serde_json::Value> {
    match content {
        MessageContent::Text(t) => vec![serde_json::json!({ "text": t })],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => serde_json::json!({ "text": text }),
                ContentPart::Image { data, media_type } => serde_json::json!({
                    "inlineData": {
                        "mimeType": media_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(data),
                    }
                }),
                ContentPart::ImageUrl { url } => serde_json::json!({
                    "fileData": { "fileUri": url }
                }),
            })
            .collect(),
    }
}

/// Classify a non-success response using the vendor envelope
/// `{ "error": { "code", "message", "status" } }`.
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
        code = err.status;
        let lower = message.to_lowercase();
        context_length = status == 400 && (lower.contains("token") || lower.contains("context"));
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
    status: Option<String>,
}

fn map_finish_reason(reason: &str, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

// Response shape shared by the single-shot and streamed payloads.

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: Option<String>,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone, Copy)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u32>,
}

impl UsageMetadata {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_token_count.unwrap_or(0),
            self.candidates_token_count.unwrap_or(0),
            self.total_token_count,
        )
    }
}

fn synthesize_call(call: FunctionCall) -> ToolCall {
    // The vendor omits ids; synthesize one unique within this response.
    ToolCall {
        id: format!("call_{}", uuid::Uuid::new_v4()),
        name: call.name.unwrap_or_default(),
        arguments: call.args.map(|a| a.to_string()).unwrap_or_default(),
    }
}

pub(crate) fn parse_response(
    raw: serde_json::Value,
    options: &ChatOptions,
    ctx: &mut RequestContext,
) -> Result<AiResponse, AiError> {
    let parsed: GenerateContentResponse = serde_json::from_value(raw.clone())?;
    let candidate = parsed
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| AiError::Parse("gemini response carried no candidates".into()))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            content.push_str(&text);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(synthesize_call(call));
        }
    }

    let usage = parsed.usage_metadata.map(UsageMetadata::into_usage);
    if let Some(u) = usage {
        ctx.token_count = u64::from(u.output_tokens);
    }

    let has_tools = !tool_calls.is_empty();
    Ok(AiResponse {
        content,
        usage,
        latency: ctx.latency(),
        model: parsed
            .model_version
            .or_else(|| options.model.clone())
            .unwrap_or_default(),
        provider: PROVIDER.to_string(),
        cached: false,
        finish_reason: candidate
            .finish_reason
            .as_deref()
            .map(|r| map_finish_reason(r, has_tools)),
        tool_calls: has_tools.then_some(tool_calls),
        raw: Some(raw),
    })
}

/// Converter for the `alt=sse` stream: reuses the generic SSE algorithm,
/// but each payload may carry a full candidate, and tool calls are complete
/// (never deltas) with synthesized ids.
#[derive(Default)]
pub(crate) struct GeminiEventConverter {
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl GeminiEventConverter {
    fn convert_payload(&mut self, payload: GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(2);

        if let Some(usage) = payload.usage_metadata.map(UsageMetadata::into_usage) {
            self.usage = Some(usage);
            events.push(StreamEvent::Usage(usage));
        }

        let Some(candidate) = payload.candidates.and_then(|c| c.into_iter().next()) else {
            return events;
        };

        let mut saw_tool_call = false;
        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::Text { delta: text });
            }
            if let Some(call) = part.function_call {
                saw_tool_call = true;
                events.push(StreamEvent::ToolCall(synthesize_call(call)));
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = Some(map_finish_reason(reason, saw_tool_call));
        }

        events
    }
}

impl EventConverter for GeminiEventConverter {
    fn convert_data(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<GenerateContentResponse>(data) {
            Ok(payload) => self.convert_payload(payload),
            Err(e) => {
                tracing::warn!("skipping undecodable gemini payload: {e}");
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
impl ProviderAdapter for GeminiAdapter {
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
        let model = options.model.as_deref().unwrap_or_default();
        let body = self.build_request_body(options);
        let request = self.request(model, "generateContent", false)?.json(&body);
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
        let model = options.model.as_deref().unwrap_or_default();
        let body = self.build_request_body(options);
        let request = self
            .request(model, "streamGenerateContent", true)?
            .json(&body);
        let response = send_cancellable(request, options.cancel.as_ref()).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        Ok(sse_event_stream(response, GeminiEventConverter::default()))
    }

    async fn embed(&self, options: &EmbedOptions) -> Result<EmbedResponse, AiError> {
        let model = options
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| AiError::Configuration("gemini: no embedding model specified".into()))?;
        let body = serde_json::json!({
            "requests": options
                .input
                .iter()
                .map(|text| serde_json::json!({
                    "model": format!("models/{model}"),
                    "content": { "parts": [{ "text": text }] },
                }))
                .collect::<Vec<_>>()
        });
        let response = self
            .request(&model, "batchEmbedContents", false)?
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &text, retry_after));
        }

        let parsed: BatchEmbedPayload = response.json().await?;
        Ok(EmbedResponse {
            embeddings: parsed
                .embeddings
                .into_iter()
                .map(|e| e.values)
                .collect(),
            model,
            usage: None,
        })
    }
}

#[derive(Deserialize)]
struct BatchEmbedPayload {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}
