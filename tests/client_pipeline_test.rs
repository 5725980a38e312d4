//! Pipeline tests for the client orchestrator: caching, layered defaults,
//! model fallback, metrics feedback, and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omnillm::prelude::*;
use serde_json::json;
use tokio::sync::RwLock;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_completion_response(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21 }
    })
}

fn builder_for(server: &MockServer) -> ClientBuilder {
    Client::builder()
        .openai(OpenAiConfig {
            api_key: Some("test-api-key".into()),
            base_url: Some(server.uri()),
            default_model: Some("gpt-4o-mini".into()),
            ..Default::default()
        })
        .default_provider("openai")
        .retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_backoff(Backoff::Fixed(Duration::from_millis(1))),
        )
        .observability(true)
}

/// Minimal in-memory cache for tests.
#[derive(Default)]
struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl CacheStorage for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) {
        self.entries.write().await.insert(key.to_string(), value);
    }
}

#[tokio::test]
async fn identical_chats_hit_the_cache_after_one_network_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder_for(&server)
        .cache(Arc::new(MemoryCache::default()))
        .build();

    let first = client.chat("Hello").await.unwrap();
    assert!(!first.cached);

    let second = client.chat("Hello").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.content, first.content);

    let summary = client.metrics();
    assert_eq!(summary.cache_lookups, 2);
    assert_eq!(summary.cache_hits, 1);
}

#[tokio::test]
async fn different_prompts_do_not_share_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("hi")))
        .expect(2)
        .mount(&server)
        .await;

    let client = builder_for(&server)
        .cache(Arc::new(MemoryCache::default()))
        .build();
    client.chat("Hello").await.unwrap();
    client.chat("Goodbye").await.unwrap();
}

#[tokio::test]
async fn extended_defaults_reach_the_wire_unless_overridden() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "temperature": 0.25 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("a")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "temperature": 0.75 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("b")))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder_for(&server)
        .build()
        .extend(ChatDefaults::new().with_temperature(0.25));

    // Default applies.
    client.chat("Hello").await.unwrap();

    // Call-time value wins over the layer.
    let mut options = ChatOptions::from_text("Hello");
    options.temperature = Some(0.75);
    client.chat(options).await.unwrap();
}

#[tokio::test]
async fn exhausted_model_falls_back_once_with_a_fresh_budget() {
    let server = MockServer::start().await;
    // The primary model always fails server-side.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-4o" })))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "boom", "type": "server_error" }
        })))
        .expect(2)
        .mount(&server)
        .await;
    // The fallback model answers.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("saved")))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder()
        .openai(OpenAiConfig {
            api_key: Some("test-api-key".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        })
        .default_provider("openai")
        .retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_backoff(Backoff::Fixed(Duration::from_millis(1)))
                .with_fallback("gpt-4o", "gpt-4o-mini"),
        )
        .observability(true)
        .build();

    let mut options = ChatOptions::from_text("Hello");
    options.model = Some("gpt-4o".into());
    let response = client.chat(options).await.unwrap();
    assert_eq!(response.content, "saved");

    // Two primary attempts plus one fallback attempt.
    let summary = client.metrics();
    assert_eq!(summary.total_attempts, 3);
    assert_eq!(summary.total_requests, 1);
}

#[tokio::test]
async fn stream_setup_falls_back_to_the_mapped_model() {
    let server = MockServer::start().await;
    // The primary model always fails server-side at setup.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-4o", "stream": true })))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "boom", "type": "server_error" }
        })))
        .expect(2)
        .mount(&server)
        .await;
    // The fallback model streams an answer.
    let sse_body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"saved\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini", "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder()
        .openai(OpenAiConfig {
            api_key: Some("test-api-key".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        })
        .default_provider("openai")
        .retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_backoff(Backoff::Fixed(Duration::from_millis(1)))
                .with_fallback("gpt-4o", "gpt-4o-mini"),
        )
        .observability(true)
        .build();

    let mut options = ChatOptions::from_text("Hello");
    options.model = Some("gpt-4o".into());
    let handle = client.stream(options).await.unwrap();

    use futures_util::StreamExt;
    let events: Vec<StreamEvent> = handle.stream.collect().await;
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "saved");
    assert!(events.last().unwrap().is_terminal());

    // Two primary attempts plus one fallback attempt.
    let summary = client.metrics();
    assert_eq!(summary.total_attempts, 3);
    assert_eq!(summary.total_requests, 1);
}

#[tokio::test]
async fn metrics_accumulate_across_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("hi")))
        .mount(&server)
        .await;

    let client = builder_for(&server).build();
    client.chat("one").await.unwrap();
    client.chat("two").await.unwrap();

    let summary = client.metrics();
    assert_eq!(summary.total_requests, 2);
    assert_eq!(summary.total_failures, 0);
    assert_eq!(summary.total_tokens, 42);
    assert_eq!(summary.by_provider["openai"].requests, 2);
    assert_eq!(summary.by_model["gpt-4o-mini"].requests, 2);
    assert!(summary.avg_total_ms >= 0.0);

    client.reset_metrics();
    assert_eq!(client.metrics().total_requests, 0);
}

#[tokio::test]
async fn failures_are_visible_in_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "bad key", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let client = builder_for(&server).build();
    let _ = client.chat("Hello").await.unwrap_err();

    let summary = client.metrics();
    assert_eq!(summary.total_requests, 1);
    assert_eq!(summary.total_failures, 1);
    assert_eq!(summary.total_attempts, 1);
}

#[tokio::test]
async fn cancelling_an_in_flight_chat_resolves_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_completion_response("too late"))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = builder_for(&server).build();
    let cancel = CancelHandle::new();
    let mut options = ChatOptions::from_text("Hello");
    options.cancel = Some(cancel.clone());

    let call = tokio::spawn(async move { client.chat(options).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("cancellation should resolve the call promptly")
        .expect("task ok");
    assert!(matches!(result, Err(AiError::Cancelled)));
}

#[tokio::test]
async fn reject_mode_rate_limit_surfaces_before_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder_for(&server)
        .rate_limit(
            RateLimitConfig::new(60)
                .with_mode(RateLimitMode::Reject)
                .with_burst(8),
        )
        .retry(RetryConfig::new().with_max_attempts(1))
        .build();

    // First call drains the tiny bucket; the second is rejected locally.
    client.chat("Hello").await.unwrap();
    let err = client.chat("Hello").await.unwrap_err();
    assert!(matches!(err, AiError::RateLimit { .. }));
}
