//! Client orchestrator
//!
//! Owns the full call pipeline: provider and model resolution, cache
//! lookup, rate-limit admission, adaptive timeout derivation, the retry
//! loop with one-shot model fallback, and metrics feedback. Adapters stay
//! pure wire translators; everything cross-cutting lives here.

use std::sync::{Arc, OnceLock, RwLock};

use futures_util::StreamExt;

use crate::cache::{chat_cache_key, CacheStorage};
use crate::error::AiError;
use crate::metrics::{Metrics, MetricsSummary};
use crate::providers::{
    AnthropicAdapter, AnthropicConfig, GeminiAdapter, GeminiConfig, OllamaAdapter, OllamaConfig,
    OpenAiAdapter, OpenAiConfig, ProviderAdapter, ProviderRegistry,
};
use crate::ratelimit::{estimate_tokens, RateLimitConfig, RateLimiter};
use crate::retry::RetryConfig;
use crate::stream::{EventStream, StreamEvent, StreamHandle};
use crate::timeout::{supervise, TimeoutConfig, TimeoutManager};
use crate::types::{
    AiResponse, ChatInput, ChatOptions, EmbedOptions, EmbedResponse, RequestContext, TokenUsage,
};
use crate::utils::cancel::cancellable_stream;

/// Reusable request defaults, layered under call-time options.
///
/// Layering order: call-time values win, then earlier [`Client::extend`]
/// layers win over later ones.
#[derive(Debug, Clone, Default)]
pub struct ChatDefaults {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Merge a later layer under this one. Fields already set here stay.
    fn merge_under(mut self, later: ChatDefaults) -> Self {
        self.provider = self.provider.or(later.provider);
        self.model = self.model.or(later.model);
        self.system_prompt = self.system_prompt.or(later.system_prompt);
        self.temperature = self.temperature.or(later.temperature);
        self.top_p = self.top_p.or(later.top_p);
        self.max_tokens = self.max_tokens.or(later.max_tokens);
        self
    }

    /// Fill only the fields the caller left unset.
    fn apply(&self, options: &mut ChatOptions) {
        if options.provider.is_none() {
            options.provider = self.provider.clone();
        }
        if options.model.is_none() {
            options.model = self.model.clone();
        }
        if options.system_prompt.is_none() {
            options.system_prompt = self.system_prompt.clone();
        }
        if options.temperature.is_none() {
            options.temperature = self.temperature;
        }
        if options.top_p.is_none() {
            options.top_p = self.top_p;
        }
        if options.max_tokens.is_none() {
            options.max_tokens = self.max_tokens;
        }
    }
}

struct ClientInner {
    registry: ProviderRegistry,
    default_provider: Option<String>,
    retry: RetryConfig,
    timeouts: TimeoutManager,
    rate_limiter: Option<RateLimiter>,
    cache: Option<Arc<dyn CacheStorage>>,
    metrics: Metrics,
    debug: bool,
}

/// The unified client. Cheap to clone; all clones share state, including
/// metrics, timeout estimates, and rate-limit buckets.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    defaults: ChatDefaults,
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    openai: Option<OpenAiConfig>,
    anthropic: Option<AnthropicConfig>,
    gemini: Option<GeminiConfig>,
    ollama: Option<OllamaConfig>,
    default_provider: Option<String>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    rate_limit: Option<RateLimitConfig>,
    cache: Option<Arc<dyn CacheStorage>>,
    observability: bool,
    debug: bool,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn openai(mut self, config: OpenAiConfig) -> Self {
        self.openai = Some(config);
        self
    }

    pub fn anthropic(mut self, config: AnthropicConfig) -> Self {
        self.anthropic = Some(config);
        self
    }

    pub fn gemini(mut self, config: GeminiConfig) -> Self {
        self.gemini = Some(config);
        self
    }

    pub fn ollama(mut self, config: OllamaConfig) -> Self {
        self.ollama = Some(config);
        self
    }

    /// Provider used when a call names none.
    pub fn default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStorage>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enable metrics collection.
    pub fn observability(mut self, enabled: bool) -> Self {
        self.observability = enabled;
        self
    }

    /// Per-request pipeline logging at debug level.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn build(self) -> Client {
        let http = reqwest::Client::new();
        let mut registry = ProviderRegistry::new();
        if let Some(config) = self.openai {
            registry.register(Arc::new(OpenAiAdapter::new(config, http.clone())));
        }
        if let Some(config) = self.anthropic {
            registry.register(Arc::new(AnthropicAdapter::new(config, http.clone())));
        }
        if let Some(config) = self.gemini {
            registry.register(Arc::new(GeminiAdapter::new(config, http.clone())));
        }
        if let Some(config) = self.ollama {
            registry.register(Arc::new(OllamaAdapter::new(config, http.clone())));
        }

        Client {
            inner: Arc::new(ClientInner {
                registry,
                default_provider: self.default_provider,
                retry: self.retry.unwrap_or_default(),
                timeouts: TimeoutManager::new(self.timeout.unwrap_or_default()),
                rate_limiter: self.rate_limit.map(RateLimiter::new),
                cache: self.cache,
                metrics: Metrics::new(self.observability),
                debug: self.debug,
            }),
            defaults: ChatDefaults::default(),
        }
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Layer request defaults onto this client. Call-time options still
    /// win; where this client already carries a default from an earlier
    /// `extend`, the earlier value is kept.
    pub fn extend(&self, defaults: ChatDefaults) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            defaults: self.defaults.clone().merge_under(defaults),
        }
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.inner.metrics.summary()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    fn resolve_provider(
        &self,
        explicit: Option<&str>,
    ) -> Result<Arc<dyn ProviderAdapter>, AiError> {
        let name = explicit
            .or(self.inner.default_provider.as_deref())
            .ok_or_else(|| {
                AiError::Configuration("no provider named and no default configured".into())
            })?;
        self.inner.registry.resolve(name).ok_or_else(|| {
            AiError::Configuration(format!(
                "provider not found: {name} (configured: {})",
                self.inner.registry.list().join(", ")
            ))
        })
    }

    fn resolve_model(
        adapter: &Arc<dyn ProviderAdapter>,
        requested: Option<String>,
    ) -> Result<String, AiError> {
        requested
            .or_else(|| adapter.default_model().map(str::to_string))
            .ok_or_else(|| {
                AiError::Configuration(format!(
                    "{}: no model named and no default configured",
                    adapter.id()
                ))
            })
    }

    async fn admit(&self, provider: &str, options: &ChatOptions) -> Result<(), AiError> {
        if let Some(limiter) = &self.inner.rate_limiter {
            limiter
                .acquire(provider, estimate_tokens(provider, options))
                .await?;
        }
        Ok(())
    }

    /// One-shot chat. Accepts a bare `&str`/`String` as a single user
    /// message or full [`ChatOptions`].
    pub async fn chat(&self, input: impl Into<ChatInput>) -> Result<AiResponse, AiError> {
        let mut options: ChatOptions = input.into().into();
        self.defaults.apply(&mut options);

        let adapter = self.resolve_provider(options.provider.as_deref())?;
        let provider = adapter.id();
        let model = Self::resolve_model(&adapter, options.model.take())?;
        options.model = Some(model.clone());

        if self.inner.debug {
            tracing::debug!(provider, model, "dispatching chat request");
        }

        let cache_key = self
            .inner
            .cache
            .as_ref()
            .map(|_| chat_cache_key(provider, &model, &options));
        if let (Some(cache), Some(key)) = (&self.inner.cache, &cache_key) {
            let hit = cache.get(key).await;
            self.inner.metrics.record_cache_lookup(hit.is_some());
            if let Some(serialized) = hit {
                match serde_json::from_str::<AiResponse>(&serialized) {
                    Ok(mut response) => {
                        response.cached = true;
                        return Ok(response);
                    }
                    Err(e) => tracing::warn!("discarding undecodable cache entry: {e}"),
                }
            }
        }

        self.admit(provider, &options).await?;

        let mut attempts = 0u32;
        let mut result = self
            .run_chat_attempts(&adapter, &options, &mut attempts)
            .await;

        // One fallback model per call, with a fresh attempt budget.
        if let Err(error) = &result
            && self.inner.retry.should_retry(error)
            && let Some(fallback) = self.inner.retry.fallback.get(&model).cloned()
        {
            tracing::warn!(
                provider,
                model,
                fallback,
                "primary model exhausted its attempts, trying fallback"
            );
            options.model = Some(fallback);
            result = self
                .run_chat_attempts(&adapter, &options, &mut attempts)
                .await;
        }

        let model_used = options.model.as_deref().unwrap_or(&model);
        match &result {
            Ok(response) => {
                self.inner.metrics.record_success(
                    provider,
                    model_used,
                    response.usage.as_ref(),
                    &response.latency,
                    attempts,
                );
                let produced_output =
                    !response.content.is_empty() || response.tool_calls.is_some();
                self.inner
                    .timeouts
                    .record(model_used, &response.latency, produced_output);
            }
            Err(_) => {
                self.inner.metrics.record_failure(provider, model_used, attempts);
            }
        }

        if let Ok(response) = &result
            && let (Some(cache), Some(key)) = (&self.inner.cache, cache_key)
            && let Ok(serialized) = serde_json::to_string(response)
        {
            cache.set(&key, serialized).await;
        }

        result
    }

    /// Drive the retry loop for one model, enforcing the derived total
    /// ceiling per attempt. A tripped ceiling cancels the call's handle
    /// and surfaces as `Cancelled`, which is never retried.
    async fn run_chat_attempts(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        options: &ChatOptions,
        attempts: &mut u32,
    ) -> Result<AiResponse, AiError> {
        let model = options.model.as_deref().unwrap_or_default();
        let pair = self.inner.timeouts.derive(model);

        let made = std::sync::atomic::AtomicU32::new(0);
        let result = self
            .inner
            .retry
            .execute(|_| {
                made.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let adapter = Arc::clone(adapter);
                let options = options.clone();
                async move {
                    let mut ctx = RequestContext::new();
                    match tokio::time::timeout(pair.total, adapter.chat(&options, &mut ctx)).await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            if let Some(cancel) = &options.cancel {
                                cancel.cancel();
                            }
                            Err(AiError::Cancelled)
                        }
                    }
                }
            })
            .await;
        *attempts += made.load(std::sync::atomic::Ordering::Relaxed);
        result
    }

    /// Streaming chat. The returned handle carries the cancel handle for
    /// the call; dropping the stream also abandons the request.
    pub async fn stream(&self, options: ChatOptions) -> Result<StreamHandle, AiError> {
        let mut options = options;
        self.defaults.apply(&mut options);

        let adapter = self.resolve_provider(options.provider.as_deref())?;
        let provider = adapter.id();
        let model = Self::resolve_model(&adapter, options.model.take())?;
        options.model = Some(model.clone());

        let cancel = options.cancel.clone().unwrap_or_default();
        options.cancel = Some(cancel.clone());

        if self.inner.debug {
            tracing::debug!(provider, model, "dispatching streaming request");
        }

        self.admit(provider, &options).await?;

        let mut attempts = 0u32;
        let mut setup = self
            .run_stream_attempts(&adapter, &options, &mut attempts)
            .await;

        // Same one-shot fallback as chat: applied once, fresh attempt budget.
        if let Err(error) = &setup
            && self.inner.retry.should_retry(error)
            && let Some(fallback) = self.inner.retry.fallback.get(&model).cloned()
        {
            tracing::warn!(
                provider,
                model,
                fallback,
                "primary model exhausted its attempts, trying fallback"
            );
            options.model = Some(fallback);
            setup = self
                .run_stream_attempts(&adapter, &options, &mut attempts)
                .await;
        }

        let model_used = options.model.clone().unwrap_or(model);
        let raw = match setup {
            Ok(stream) => stream,
            Err(error) => {
                self.inner
                    .metrics
                    .record_failure(provider, &model_used, attempts);
                return Err(error);
            }
        };

        let pair = self.inner.timeouts.derive(&model_used);
        let guarded = supervise(
            cancellable_stream(raw, cancel.clone()),
            pair,
            cancel.clone(),
        );
        let stream = self.instrument(guarded, provider.to_string(), model_used, attempts);

        Ok(StreamHandle { stream, cancel })
    }

    /// Drive the retry loop around stream setup. Failures after the first
    /// byte are the stream's own terminal events and never come back here.
    async fn run_stream_attempts(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        options: &ChatOptions,
        attempts: &mut u32,
    ) -> Result<EventStream, AiError> {
        let made = std::sync::atomic::AtomicU32::new(0);
        let result = self
            .inner
            .retry
            .execute(|_| {
                made.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let adapter = Arc::clone(adapter);
                let options = options.clone();
                async move { adapter.stream(&options).await }
            })
            .await;
        *attempts += made.load(std::sync::atomic::Ordering::Relaxed);
        result
    }

    /// Outermost stream layer: owns the call's timing context, enforces
    /// the terminal-event contract, and feeds metrics and the timeout
    /// manager once the stream concludes.
    fn instrument(
        &self,
        mut stream: EventStream,
        provider: String,
        model: String,
        attempts: u32,
    ) -> EventStream {
        let inner = Arc::clone(&self.inner);
        Box::pin(async_stream::stream! {
            let mut ctx = RequestContext::new();
            let mut usage: Option<TokenUsage> = None;
            let mut outcome: Option<bool> = None; // Some(true) = clean Done

            while let Some(event) = stream.next().await {
                match &event {
                    // First-token time is a text-latency figure; tool-call
                    // traffic counts toward throughput but not TTFT.
                    StreamEvent::Text { .. } => {
                        ctx.mark_first_token();
                        ctx.token_count += 1;
                    }
                    StreamEvent::ToolCall(_) | StreamEvent::ToolCallDelta { .. } => {
                        ctx.token_count += 1;
                    }
                    StreamEvent::Usage(u) => {
                        usage = Some(*u);
                        ctx.token_count = u64::from(u.output_tokens);
                    }
                    StreamEvent::Done { usage: done_usage, .. } => {
                        if let Some(u) = done_usage {
                            usage = Some(*u);
                            ctx.token_count = u64::from(u.output_tokens);
                        }
                        outcome = Some(true);
                    }
                    StreamEvent::Error(_) => {
                        outcome = Some(false);
                    }
                }
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }

            let latency = ctx.latency();
            // Every concluded stream feeds the estimates, cancelled and
            // failed ones included; only unseen first tokens are skipped.
            inner
                .timeouts
                .record(&model, &latency, ctx.first_token_at.is_some());
            match outcome {
                Some(true) => inner.metrics.record_success(
                    &provider,
                    &model,
                    usage.as_ref(),
                    &latency,
                    attempts,
                ),
                // Terminal error, or cancellation ended the stream early.
                _ => inner.metrics.record_failure(&provider, &model, attempts),
            }
        })
    }

    /// Embeddings. No cache; the retry loop and rate limiter still apply.
    pub async fn embed(&self, options: EmbedOptions) -> Result<EmbedResponse, AiError> {
        let provider_name = options
            .provider
            .clone()
            .or_else(|| self.defaults.provider.clone());
        let adapter = self.resolve_provider(provider_name.as_deref())?;
        let provider = adapter.id();

        if let Some(limiter) = &self.inner.rate_limiter {
            let cost: u64 = options
                .input
                .iter()
                .map(|text| (text.len() as f64 / 4.0).ceil() as u64)
                .sum();
            limiter.acquire(provider, cost).await?;
        }

        let made = std::sync::atomic::AtomicU32::new(0);
        let ctx = RequestContext::new();
        let result = self
            .inner
            .retry
            .execute(|_| {
                made.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let adapter = Arc::clone(&adapter);
                let options = options.clone();
                async move { adapter.embed(&options).await }
            })
            .await;

        let model = options.model.as_deref().unwrap_or_default();
        match &result {
            Ok(response) => self.inner.metrics.record_success(
                provider,
                &response.model,
                response.usage.as_ref(),
                &ctx.latency(),
                made.load(std::sync::atomic::Ordering::Relaxed),
            ),
            Err(_) => self.inner.metrics.record_failure(
                provider,
                model,
                made.load(std::sync::atomic::Ordering::Relaxed),
            ),
        }
        result
    }
}

static DEFAULT_CLIENT: OnceLock<RwLock<Option<Client>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<Client>> {
    DEFAULT_CLIENT.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide default client. Replaces any previous one;
/// in-flight calls on the old client are unaffected.
pub fn set_default_client(client: Client) {
    let slot = default_slot();
    match slot.write() {
        Ok(mut guard) => *guard = Some(client),
        Err(poisoned) => *poisoned.into_inner() = Some(client),
    }
}

/// The process-wide default client, if one was installed.
pub fn default_client() -> Result<Client, AiError> {
    let slot = default_slot();
    let guard = match slot.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.clone().ok_or_else(|| {
        AiError::Configuration(
            "no default client installed; call set_default_client first".into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_default(model: &str) -> Client {
        Client::builder()
            .openai(OpenAiConfig {
                api_key: Some("sk-test".into()),
                default_model: Some(model.into()),
                ..Default::default()
            })
            .default_provider("openai")
            .build()
    }

    #[test]
    fn extend_layers_earlier_over_later() {
        let client = client_with_default("gpt-4o");
        let layered = client
            .extend(ChatDefaults::new().with_temperature(0.2).with_model("gpt-4o"))
            .extend(ChatDefaults::new().with_temperature(0.9).with_max_tokens(50));

        let mut options = ChatOptions::from_text("hi");
        layered.defaults.apply(&mut options);
        // Earlier extension wins where both set a value.
        assert_eq!(options.temperature, Some(0.2));
        // Later extension fills what the earlier one left open.
        assert_eq!(options.max_tokens, Some(50));
        assert_eq!(options.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn call_time_options_beat_every_layer() {
        let client = client_with_default("gpt-4o")
            .extend(ChatDefaults::new().with_temperature(0.2));
        let mut options = ChatOptions::from_text("hi");
        options.temperature = Some(1.0);
        client.defaults.apply(&mut options);
        assert_eq!(options.temperature, Some(1.0));
    }

    #[tokio::test]
    async fn unknown_provider_is_a_configuration_error() {
        let client = client_with_default("gpt-4o");
        let mut options = ChatOptions::from_text("hi");
        options.provider = Some("nonexistent".into());
        let err = client.chat(options).await.unwrap_err();
        match err {
            AiError::Configuration(message) => {
                assert!(message.contains("provider not found"));
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_model_is_a_configuration_error() {
        let client = Client::builder()
            .openai(OpenAiConfig {
                api_key: Some("sk-test".into()),
                ..Default::default()
            })
            .default_provider("openai")
            .build();
        let err = client.chat("hi").await.unwrap_err();
        assert!(matches!(err, AiError::Configuration(_)));
    }

    #[tokio::test]
    async fn concluded_streams_feed_timeout_estimates_even_on_failure() {
        let client = client_with_default("gpt-4o");
        let raw: EventStream = Box::pin(futures_util::stream::iter(vec![
            StreamEvent::Text { delta: "par".into() },
            StreamEvent::Error(AiError::Stream("connection reset".into())),
        ]));
        let mut instrumented = client.instrument(raw, "openai".into(), "gpt-4o".into(), 1);
        while instrumented.next().await.is_some() {}

        // The failed call still tightened the ceilings below the maxima.
        let pair = client.inner.timeouts.derive("gpt-4o");
        let maxima = TimeoutConfig::default();
        assert!(pair.total < maxima.total);
        assert!(pair.first_token < maxima.first_token);
    }

    #[tokio::test]
    async fn tool_only_streams_leave_the_ttft_estimate_untouched() {
        use crate::types::{FinishReason, ToolCall};

        let client = client_with_default("gpt-4o");
        let raw: EventStream = Box::pin(futures_util::stream::iter(vec![
            StreamEvent::ToolCall(ToolCall {
                id: "call_1".into(),
                name: "lookup".into(),
                arguments: "{}".into(),
            }),
            StreamEvent::Done {
                finish_reason: Some(FinishReason::ToolCalls),
                usage: None,
            },
        ]));
        let mut instrumented = client.instrument(raw, "openai".into(), "gpt-4o".into(), 1);
        while instrumented.next().await.is_some() {}

        let pair = client.inner.timeouts.derive("gpt-4o");
        // No text token was seen, so the first-token ceiling stays put
        // while the total ceiling tightens.
        assert_eq!(pair.first_token, TimeoutConfig::default().first_token);
        assert!(pair.total < TimeoutConfig::default().total);
    }

    #[tokio::test]
    async fn default_client_roundtrip() {
        assert!(default_client().is_err() || default_client().is_ok());
        set_default_client(client_with_default("gpt-4o"));
        let restored = default_client().unwrap();
        assert!(restored.inner.registry.resolve("openai").is_some());
    }
}
