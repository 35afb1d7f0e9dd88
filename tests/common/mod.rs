use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmhost::llm::{KnownModel, PackagingType, PromptEncoding, Session, SessionOptions};

pub const OPENAI_MODEL: &str = "Meta-Llama-3-8B-Instruct-Q5_K_M";
pub const NATIVE_MODEL: &str = "Mistral-7B-Instruct-v0.3-Q4_K_M";

#[allow(dead_code)]
pub fn llama3_known() -> KnownModel {
    KnownModel {
        repo: "bartowski/Meta-Llama-3-8B-Instruct-GGUF".to_string(),
        packaging_type: PackagingType::Gguf,
        basename: "Meta-Llama-3-8B-Instruct-".to_string(),
        upstream: "meta-llama/Meta-Llama-3-8B-Instruct".to_string(),
        prompt_encoding: None,
    }
}

#[allow(dead_code)]
pub fn mistral_encoding() -> PromptEncoding {
    PromptEncoding {
        begin_of_text: "<s>".to_string(),
        system_token_start: "[INST]".to_string(),
        system_token_end: "[/INST]".to_string(),
        user_token_start: "[INST]".to_string(),
        user_token_end: "[/INST]".to_string(),
        assistant_token_end: "</s>".to_string(),
        tools_available_token_start: "[AVAILABLE_TOOLS]".to_string(),
        tools_available_token_end: "[/AVAILABLE_TOOLS]".to_string(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn mistral_known() -> KnownModel {
    KnownModel {
        repo: "bartowski/Mistral-7B-Instruct-v0.3-GGUF".to_string(),
        packaging_type: PackagingType::Gguf,
        basename: "Mistral-7B-Instruct-v0.3-".to_string(),
        upstream: "mistralai/Mistral-7B-Instruct-v0.3".to_string(),
        prompt_encoding: Some(mistral_encoding()),
    }
}

/// `host:port` of a mock server
#[allow(dead_code)]
pub fn remote_of(server: &MockServer) -> String {
    server
        .uri()
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[allow(dead_code)]
pub async fn mount_health_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
        .mount(server)
        .await;
}

/// Start a remote session against `server`, which must answer `/health`.
#[allow(dead_code)]
pub async fn remote_session(server: &MockServer, model: &str) -> (Session, TempDir) {
    let cache = TempDir::new().expect("failed to create tempdir");
    let opts = SessionOptions {
        model: model.to_string(),
        remote: Some(remote_of(server)),
        ..Default::default()
    };
    let session = Session::start(
        &opts,
        &[llama3_known(), mistral_known()],
        cache.path(),
        CancellationToken::new(),
    )
    .await
    .expect("remote session should start");
    (session, cache)
}

/// Server-sent event body made of `data: <line>` records
#[allow(dead_code)]
pub fn sse_body(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|l| format!("data: {}\n\n", l))
        .collect::<String>()
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
