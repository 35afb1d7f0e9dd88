//! Protocol client integration tests
//!
//! Both clients are exercised against a `wiremock` server. Streamed bodies
//! are sent with `set_body_raw` so the line framing reaches the parser
//! untouched.

mod common;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{mistral_encoding, sse_body};
use llmhost::error::LlmHostError;
use llmhost::llm::{create_client, Message, Role, SamplingParams};

async fn collect_stream(
    client: &dyn llmhost::llm::CompletionClient,
    msgs: &[Message],
) -> (Vec<String>, llmhost::llm::StreamOutcome) {
    let (tx, mut rx) = mpsc::channel(16);
    let outcome = client
        .generate_streaming(msgs, &SamplingParams::default(), tx, CancellationToken::new())
        .await;
    let mut fragments = Vec::new();
    while let Ok(f) = rx.try_recv() {
        fragments.push(f);
    }
    (fragments, outcome)
}

#[tokio::test]
async fn test_openai_stream_until_done() {
    let server = MockServer::start().await;
    let body = sse_body(&[r#"{"choices":[{"delta":{"content":"hi"}}]}"#, "[DONE]"]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "model": "ignored"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), None, reqwest::Client::new());
    let (fragments, outcome) = collect_stream(client.as_ref(), &[Message::user("hello")]).await;

    assert_eq!(fragments, vec!["hi".to_string()]);
    assert_eq!(outcome.into_result().unwrap(), "hi");
}

#[tokio::test]
async fn test_openai_generate_matches_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello there"}, "finish_reason": "stop"}]
        })))
        .mount(&server)
        .await;
    let body = sse_body(&[
        r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
        r#"{"choices":[{"delta":{"content":" there"}}]}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), None, reqwest::Client::new());
    let msgs = [Message::system("be brief"), Message::user("hi")];
    let full = client
        .generate(&msgs, &SamplingParams::default())
        .await
        .unwrap();
    let (fragments, outcome) = collect_stream(client.as_ref(), &msgs).await;

    assert_eq!(fragments, vec!["Hello", " there"]);
    assert_eq!(outcome.into_result().unwrap(), full);
}

#[tokio::test]
async fn test_openai_http_error_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), None, reqwest::Client::new());
    let err = client
        .generate(&[Message::user("hi")], &SamplingParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LlmHostError>(),
        Some(LlmHostError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_openai_stream_rejects_unprefixed_line() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ngarbage\n",
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), None, reqwest::Client::new());
    let (fragments, outcome) = collect_stream(client.as_ref(), &[Message::user("hi")]).await;
    assert_eq!(fragments, vec!["a"]);
    assert_eq!(outcome.text, "a");
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn test_native_stream_and_generate_agree() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .and(body_partial_json(json!({
            "stream": false,
            "cache_prompt": true,
            "prompt": "<s>[INST]be brief[/INST][INST]hi[/INST]"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "Hello there",
            "stop": true,
            "timings": {"prompt_n": 12, "predicted_n": 3, "predicted_per_second": 42.0}
        })))
        .mount(&server)
        .await;
    let body = concat!(
        "data: {\"content\":\"Hello\",\"stop\":false}\n\n",
        "data: {\"content\":\" there\",\"stop\":false}\n\n",
        "data: {\"content\":\"\",\"stop\":true,\"timings\":{\"predicted_n\":2}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/completion"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), Some(mistral_encoding()), reqwest::Client::new());
    assert_eq!(client.name(), "llamacpp");
    let msgs = [Message::system("be brief"), Message::user("hi")];
    let full = client
        .generate(&msgs, &SamplingParams::default())
        .await
        .unwrap();
    let (fragments, outcome) = collect_stream(client.as_ref(), &msgs).await;

    assert_eq!(full, "Hello there");
    assert_eq!(fragments, vec!["Hello", " there"]);
    assert_eq!(outcome.into_result().unwrap(), full);
}

#[tokio::test]
async fn test_native_rejects_bad_role_order_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), Some(mistral_encoding()), reqwest::Client::new());
    let msgs = [
        Message::new(Role::AvailableTools, "[]"),
        Message::new(Role::AvailableTools, "[]"),
        Message::user("hi"),
    ];
    let err = client
        .generate(&msgs, &SamplingParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LlmHostError>(),
        Some(LlmHostError::InvalidPromptSequence(_))
    ));

    let (fragments, outcome) = collect_stream(client.as_ref(), &msgs).await;
    assert!(fragments.is_empty());
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn test_stream_cancelled_when_receiver_dropped() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"choices":[{"delta":{"content":"a"}}]}"#,
        r#"{"choices":[{"delta":{"content":"b"}}]}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = create_client(&server.uri(), None, reqwest::Client::new());
    let (tx, rx) = mpsc::channel(16);
    drop(rx);
    let outcome = client
        .generate_streaming(
            &[Message::user("hi")],
            &SamplingParams::default(),
            tx,
            CancellationToken::new(),
        )
        .await;
    let err = outcome.error.expect("closed receiver must end the stream");
    assert!(matches!(
        err.downcast_ref::<LlmHostError>(),
        Some(LlmHostError::Cancelled)
    ));
}
