//! Mock API tests for the OpenAI adapter and the retry pipeline.
//!
//! Response formats follow the official API reference:
//! https://platform.openai.com/docs/api-reference/chat/create

use std::time::Duration;

use omnillm::prelude::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
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
        "usage": {
            "prompt_tokens": 9,
            "completion_tokens": 12,
            "total_tokens": 21
        }
    })
}

fn error_response(message: &str, error_type: &str, code: Option<&str>) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "param": null,
            "code": code
        }
    })
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(max_attempts)
        .with_backoff(Backoff::Fixed(Duration::from_millis(1)))
}

fn client_for(server: &MockServer) -> Client {
    Client::builder()
        .openai(OpenAiConfig {
            api_key: Some("test-api-key".into()),
            base_url: Some(server.uri()),
            default_model: Some("gpt-4o-mini".into()),
            ..Default::default()
        })
        .default_provider("openai")
        .retry(fast_retry(3))
        .observability(true)
        .build()
}

#[tokio::test]
async fn chat_with_text_sugar_sends_one_user_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-api-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [{ "role": "user", "content": "Hello" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("Hi!")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client.chat("Hello").await.unwrap();
    assert_eq!(response.content, "Hi!");
    assert_eq!(response.provider, "openai");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens, 21);
    assert!(!response.cached);
}

#[tokio::test]
async fn text_sugar_and_explicit_options_hit_the_same_wire_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [{ "role": "user", "content": "Hello" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_response("ok")))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let from_sugar = client.chat("Hello").await.unwrap();
    let from_options = client
        .chat(ChatOptions::from_text("Hello"))
        .await
        .unwrap();
    assert_eq!(from_sugar.content, from_options.content);
}

#[tokio::test]
async fn server_errors_retry_up_to_the_attempt_bound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(error_response("upstream exploded", "server_error", None)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.chat("Hello").await.unwrap_err();
    match err {
        AiError::Api { status, .. } => assert_eq!(status, 500),
        other => panic!("expected Api, got {other:?}"),
    }
}

#[tokio::test]
async fn authentication_failures_are_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(error_response(
                "Incorrect API key provided",
                "invalid_request_error",
                Some("invalid_api_key"),
            )),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.chat("Hello").await.unwrap_err();
    assert!(matches!(err, AiError::Authentication { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn client_errors_fail_after_a_single_invocation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(error_response(
                "Invalid value for temperature",
                "invalid_request_error",
                None,
            )),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.chat("Hello").await.unwrap_err();
    match err {
        AiError::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("expected Api, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_then_success_takes_exactly_two_invocations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(error_response("Rate limit reached", "rate_limit_error", None)),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_response("recovered")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client.chat("Hello").await.unwrap();
    assert_eq!(response.content, "recovered");
}

#[tokio::test]
async fn context_length_overflow_maps_to_its_own_variant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(error_response(
                "This model's maximum context length is 128000 tokens",
                "invalid_request_error",
                Some("context_length_exceeded"),
            )),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.chat("Hello").await.unwrap_err();
    assert!(matches!(err, AiError::ContextLength { .. }));
}

#[tokio::test]
async fn streaming_deltas_arrive_in_order_with_one_terminal() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" World\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let handle = client
        .stream(ChatOptions::from_text("Hello"))
        .await
        .unwrap();

    use futures_util::StreamExt;
    let events: Vec<StreamEvent> = handle.stream.collect().await;

    let mut text = String::new();
    let mut terminals = 0;
    for event in &events {
        match event {
            StreamEvent::Text { delta } => text.push_str(delta),
            StreamEvent::Done { finish_reason, .. } => {
                terminals += 1;
                assert_eq!(*finish_reason, Some(FinishReason::Stop));
            }
            StreamEvent::Error(e) => panic!("unexpected stream error: {e}"),
            _ => {}
        }
    }
    assert_eq!(text, "Hello World");
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn embeddings_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                { "object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3] }
            ],
            "model": "text-embedding-3-small",
            "usage": { "prompt_tokens": 5, "total_tokens": 5 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client
        .embed(EmbedOptions {
            provider: Some("openai".into()),
            model: Some("text-embedding-3-small".into()),
            input: vec!["hello".into()],
        })
        .await
        .unwrap();
    assert_eq!(response.embeddings.len(), 1);
    assert_eq!(response.embeddings[0].len(), 3);
}
