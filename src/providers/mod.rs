//! Provider Adapters
//!
//! A closed set of vendor adapters behind one contract, dispatched by
//! provider name through a fixed registry. Adapters translate the unified
//! request into the vendor wire format, issue the call, and classify
//! failures into the error taxonomy; the orchestrator never reclassifies.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AiError;
use crate::stream::EventStream;
use crate::types::{AiResponse, ChatOptions, EmbedOptions, EmbedResponse, RequestContext};
use crate::utils::cancel::CancelHandle;

pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use gemini::{GeminiAdapter, GeminiConfig};
pub use ollama::{OllamaAdapter, OllamaConfig};
pub use openai::{OpenAiAdapter, OpenAiConfig};

/// Contract every vendor adapter implements.
///
/// `chat`/`embed` setup and vendor failures return `Err`; `stream` returns
/// `Err` only for setup failures; anything after the first byte surfaces
/// as a terminal `Error` event on the stream itself.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name used for registry dispatch and error tagging.
    fn id(&self) -> &'static str;

    /// Model used when neither the call nor the client defaults name one.
    fn default_model(&self) -> Option<&str>;

    async fn chat(
        &self,
        options: &ChatOptions,
        ctx: &mut RequestContext,
    ) -> Result<AiResponse, AiError>;

    async fn stream(&self, options: &ChatOptions) -> Result<EventStream, AiError>;

    async fn embed(&self, _options: &EmbedOptions) -> Result<EmbedResponse, AiError> {
        Err(AiError::Unsupported(format!(
            "{}: embeddings are unsupported by this provider",
            self.id()
        )))
    }
}

/// Fixed provider registry. The vendor set is enumerable; there is no
/// open-ended plugin loading.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    by_id: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.by_id.insert(adapter.id().to_string(), adapter);
    }

    pub fn resolve(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.by_id.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.by_id.keys().map(String::as_str).collect()
    }
}

/// Map an HTTP failure to the taxonomy. `message`/`code` come from the
/// vendor envelope (message verbatim); `context_length` is the vendor's
/// context-overflow signal on a 400. Idempotent by construction.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    message: String,
    code: Option<String>,
    retry_after: Option<Duration>,
    context_length: bool,
) -> AiError {
    match status {
        401 => AiError::Authentication {
            provider: provider.to_string(),
            message,
        },
        429 => AiError::RateLimit {
            provider: provider.to_string(),
            message,
            retry_after,
        },
        503 | 529 => AiError::Overloaded {
            provider: provider.to_string(),
            message,
        },
        400 if context_length => AiError::ContextLength {
            provider: provider.to_string(),
            message,
        },
        _ => AiError::Api {
            provider: provider.to_string(),
            status,
            code,
            message,
        },
    }
}

/// Parse a `retry-after` header (seconds form only).
pub(crate) fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Send a request, racing against the call's cancellation signal.
pub(crate) async fn send_cancellable(
    builder: reqwest::RequestBuilder,
    cancel: Option<&CancelHandle>,
) -> Result<reqwest::Response, AiError> {
    match cancel {
        Some(handle) => {
            tokio::select! {
                _ = handle.cancelled() => Err(AiError::Cancelled),
                resp = builder.send() => resp.map_err(AiError::from),
            }
        }
        None => builder.send().await.map_err(AiError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_idempotent_per_status() {
        for _ in 0..3 {
            let err = classify_status("openai", 429, "limited".into(), None, None, false);
            assert!(matches!(err, AiError::RateLimit { .. }));
            assert!(err.is_retryable());
        }
        let err = classify_status("openai", 529, "busy".into(), None, None, false);
        assert!(matches!(err, AiError::Overloaded { .. }));

        let err = classify_status("openai", 400, "too long".into(), None, None, true);
        assert!(matches!(err, AiError::ContextLength { .. }));
        assert!(!err.is_retryable());

        let err = classify_status("openai", 418, "teapot".into(), None, None, false);
        assert!(!err.is_retryable());
        let err = classify_status("openai", 500, "boom".into(), None, None, false);
        assert!(err.is_retryable());
    }
}
