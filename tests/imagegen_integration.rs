//! Image engine integration tests against a remote mock engine

mod common;

use base64::Engine;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::remote_of;
use llmhost::error::LlmHostError;
use llmhost::imagegen::{ImageOptions, ImageSession};

fn fake_png() -> Vec<u8> {
    let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
    png.extend_from_slice(b"IHDR...");
    png
}

fn image_body(png: &[u8]) -> serde_json::Value {
    json!({"image": base64::engine::general_purpose::STANDARD.encode(png)})
}

#[tokio::test]
async fn test_probe_then_configured_steps() {
    let server = MockServer::start().await;
    let png = fake_png();
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"message": "cat", "steps": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_body(&png)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"message": "a red fox", "steps": 4, "seed": 7})))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_body(&png)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = tempfile::TempDir::new().unwrap();
    let opts = ImageOptions {
        remote: Some(remote_of(&server)),
        steps: 4,
        ..Default::default()
    };
    let session = ImageSession::start(&opts, cache.path(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(session.steps(), 4);

    let out = session.generate("a red fox", 7).await.unwrap();
    assert_eq!(out, png);
    session.close().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_engine_keeps_loading_until_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cache = tempfile::TempDir::new().unwrap();
    let opts = ImageOptions {
        remote: Some(remote_of(&server)),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };
    let err = ImageSession::start(&opts, cache.path(), cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(
        err.downcast_ref::<LlmHostError>(),
        Some(LlmHostError::Cancelled)
    ));
}

#[tokio::test]
async fn test_non_png_reply_is_protocol_error() {
    let server = MockServer::start().await;
    let png = fake_png();
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"message": "cat"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_body(&png)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_body(b"GIF89a")))
        .mount(&server)
        .await;

    let cache = tempfile::TempDir::new().unwrap();
    let opts = ImageOptions {
        remote: Some(remote_of(&server)),
        ..Default::default()
    };
    let session = ImageSession::start(&opts, cache.path(), CancellationToken::new())
        .await
        .unwrap();
    let err = session.generate("a dog", 1).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LlmHostError>(),
        Some(LlmHostError::Protocol(_))
    ));
}
