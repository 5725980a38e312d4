//! # OmniLLM - A Unified AI Provider Gateway
//!
//! OmniLLM is a unified client library for chat-completion and embedding
//! APIs, speaking each vendor's native wire protocol behind one request and
//! response model. It ships adapters for OpenAI, Anthropic, Google Gemini,
//! and local Ollama, plus the cross-cutting machinery a production caller
//! needs: retry with backoff and model fallback, client-side rate limiting,
//! adaptive timeouts, response caching, and metrics.
//!
//! ## Features
//!
//! - **One request model**: the same [`ChatOptions`](types::ChatOptions)
//!   works against every provider; adapters translate to the vendor format.
//! - **One stream model**: OpenAI's SSE, Anthropic's named-event SSE,
//!   Gemini's `alt=sse` frames, and Ollama's NDJSON all become the same
//!   [`StreamEvent`](stream::StreamEvent) sequence, ending in exactly one
//!   terminal event.
//! - **One error taxonomy**: vendor failures classify into
//!   [`AiError`](error::AiError) variants with uniform retryability rules.
//! - **Resilience built in**: decorrelated-jitter retries, per-provider
//!   token buckets, and per-model latency-derived timeout ceilings.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use omnillm::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .openai(OpenAiConfig {
//!             default_model: Some("gpt-4o-mini".into()),
//!             ..Default::default()
//!         })
//!         .default_provider("openai")
//!         .observability(true)
//!         .build();
//!
//!     // Bare text is sugar for a single user message.
//!     let response = client.chat("Hello, world!").await?;
//!     println!("{}", response.content);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use omnillm::prelude::*;
//! use futures_util::StreamExt;
//!
//! # async fn demo(client: Client) -> Result<(), omnillm::error::AiError> {
//! let handle = client.stream(ChatOptions::from_text("tell me a story")).await?;
//! let mut stream = handle.stream;
//! while let Some(event) = stream.next().await {
//!     match event {
//!         StreamEvent::Text { delta } => print!("{delta}"),
//!         StreamEvent::Done { .. } => break,
//!         StreamEvent::Error(e) => return Err(e),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod cache;
pub mod client;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod ratelimit;
pub mod retry;
pub mod stream;
pub mod timeout;
pub mod types;
pub mod utils;

pub use client::{default_client, set_default_client, ChatDefaults, Client, ClientBuilder};
pub use error::{AiError, ErrorKind};
pub use stream::{EventStream, StreamEvent, StreamHandle};
pub use types::{AiResponse, ChatMessage, ChatOptions, TokenUsage};

/// Common imports for typical usage.
pub mod prelude {
    pub use crate::cache::CacheStorage;
    pub use crate::client::{
        default_client, set_default_client, ChatDefaults, Client, ClientBuilder,
    };
    pub use crate::error::{AiError, ErrorKind};
    pub use crate::metrics::MetricsSummary;
    pub use crate::providers::{AnthropicConfig, GeminiConfig, OllamaConfig, OpenAiConfig};
    pub use crate::ratelimit::{RateLimitConfig, RateLimitMode};
    pub use crate::retry::{Backoff, RetryConfig};
    pub use crate::stream::{EventStream, StreamEvent, StreamHandle};
    pub use crate::timeout::TimeoutConfig;
    pub use crate::types::{
        AiResponse, ChatInput, ChatMessage, ChatOptions, ContentPart, EmbedOptions,
        EmbedResponse, FinishReason, MessageContent, MessageRole, ResponseFormat, TokenUsage,
        Tool, ToolCall, ToolChoice,
    };
    pub use crate::utils::cancel::CancelHandle;
}
