//! Mock API tests for the Anthropic adapter.
//!
//! Response formats follow the official Messages API reference:
//! https://docs.anthropic.com/en/api/messages

use std::time::Duration;

use omnillm::prelude::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn messages_response(text: &str) -> serde_json::Value {
    json!({
        "id": "msg_01XFDUDYJgAACzvnptvVoYEL",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-5-haiku-20241022",
        "content": [{ "type": "text", "text": text }],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": { "input_tokens": 10, "output_tokens": 25 }
    })
}

fn client_for(server: &MockServer) -> Client {
    Client::builder()
        .anthropic(AnthropicConfig {
            api_key: Some("test-api-key".into()),
            base_url: Some(server.uri()),
            default_model: Some("claude-3-5-haiku-20241022".into()),
            ..Default::default()
        })
        .default_provider("anthropic")
        .retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_backoff(Backoff::Fixed(Duration::from_millis(1))),
        )
        .build()
}

#[tokio::test]
async fn system_prompt_rides_in_the_system_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-api-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "system": "You are terse.",
            "messages": [{ "role": "user", "content": "Hello" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_response("Hi.")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut options = ChatOptions::from_text("Hello");
    options.system_prompt = Some("You are terse.".into());
    let response = client.chat(options).await.unwrap();
    assert_eq!(response.content, "Hi.");
    assert_eq!(response.usage.unwrap().input_tokens, 10);
}

#[tokio::test]
async fn max_tokens_is_always_present_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({ "max_tokens": 4096 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_response("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.chat("Hello").await.unwrap();
}

#[tokio::test]
async fn overloaded_529_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_response("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client.chat("Hello").await.unwrap();
    assert_eq!(response.content, "recovered");
}

#[tokio::test]
async fn named_event_stream_reassembles_text_and_usage() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" World\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":12}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
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
    let mut final_usage = None;
    let mut terminals = 0;
    for event in &events {
        match event {
            StreamEvent::Text { delta } => text.push_str(delta),
            StreamEvent::Usage(u) => final_usage = Some(*u),
            StreamEvent::Done { .. } => terminals += 1,
            StreamEvent::Error(e) => panic!("unexpected stream error: {e}"),
            _ => {}
        }
    }
    assert_eq!(text, "Hello World");
    assert_eq!(terminals, 1);
    let usage = final_usage.expect("usage event before done");
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.output_tokens, 12);
}

#[tokio::test]
async fn embeddings_are_unsupported() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let err = client
        .embed(EmbedOptions {
            provider: Some("anthropic".into()),
            model: None,
            input: vec!["hello".into()],
        })
        .await
        .unwrap_err();
    match err {
        AiError::Unsupported(ref message) => {
            assert!(message.contains("anthropic"));
            assert!(message.contains("embeddings"));
        }
        other => panic!("expected Unsupported, got {other:?}"),
    }
    assert!(!err.is_retryable());
}
