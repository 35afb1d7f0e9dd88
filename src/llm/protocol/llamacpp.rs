//! Native llama.cpp completion protocol
//!
//! The server's `/completion` endpoint takes one flat prompt string, so the
//! message list is rendered with the model's [`PromptEncoding`] literals
//! first. Streaming replies are one JSON record per line.

use super::{drive_line_stream, post_json, CompletionClient, LineEvent, StreamOutcome};
use crate::error::{LlmHostError, Result};
use crate::llm::{Message, PromptEncoding, Role, SamplingParams};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct CompletionRequest {
    prompt: String,
    seed: i64,
    temperature: f64,
    cache_prompt: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    timings: Timings,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Timings {
    #[serde(default)]
    prompt_n: i64,
    #[serde(default)]
    predicted_n: i64,
    #[serde(default)]
    predicted_per_second: f64,
}

impl CompletionResponse {
    fn check_error(&self) -> Result<()> {
        match &self.error {
            Some(err) => {
                Err(LlmHostError::Protocol(format!("engine reported error: {}", err)).into())
            }
            None => Ok(()),
        }
    }

    fn log_timings(&self) {
        tracing::debug!(
            prompt_tokens = self.timings.prompt_n,
            generated_tokens = self.timings.predicted_n,
            tokens_per_second = self.timings.predicted_per_second,
            "completion timings"
        );
    }
}

/// Phase of the role-order check performed while rendering a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Start,
    Tools,
    System,
    Dialog,
}

/// Render `messages` into a single prompt using `encoding`.
///
/// The prompt starts with `begin_of_text` and wraps every message in its
/// role's literals. `available_tools` may only appear first, and `system`
/// may only follow `available_tools`.
///
/// # Errors
///
/// Returns `LlmHostError::InvalidPromptSequence` when the role order is not
/// representable.
pub fn build_prompt(encoding: &PromptEncoding, messages: &[Message]) -> Result<String> {
    let mut phase = Phase::Start;
    let mut prompt = encoding.begin_of_text.clone();
    for (i, msg) in messages.iter().enumerate() {
        phase = match msg.role {
            Role::AvailableTools => {
                if i != 0 {
                    return Err(LlmHostError::InvalidPromptSequence(format!(
                        "unexpected available_tools message at index {}",
                        i
                    ))
                    .into());
                }
                Phase::Tools
            }
            Role::System => {
                if phase > Phase::Tools {
                    return Err(LlmHostError::InvalidPromptSequence(format!(
                        "unexpected system message at index {}",
                        i
                    ))
                    .into());
                }
                Phase::System
            }
            Role::User | Role::Assistant | Role::ToolCall | Role::ToolCallResult => Phase::Dialog,
        };
        let (start, end) = encoding.delimiters(msg.role);
        prompt.push_str(start);
        prompt.push_str(&msg.content);
        prompt.push_str(end);
    }
    Ok(prompt)
}

fn parse_stream_line(line: &str) -> Result<LineEvent> {
    let data = line.strip_prefix("data: ").unwrap_or(line);
    let record: CompletionResponse = serde_json::from_str(data).map_err(|e| {
        LlmHostError::Protocol(format!("failed to decode stream record {:?}: {}", data, e))
    })?;
    record.check_error()?;
    if record.stop {
        record.log_timings();
        return Ok(LineEvent::Done(Some(record.content)));
    }
    Ok(LineEvent::Fragment(record.content))
}

/// Client for llama.cpp's native `/completion` endpoint
pub struct LlamaCppClient {
    http: reqwest::Client,
    url: String,
    encoding: PromptEncoding,
}

impl LlamaCppClient {
    /// Creates a client for the server at `base_url` using `encoding`
    pub fn new(base_url: &str, encoding: PromptEncoding, http: reqwest::Client) -> Self {
        Self {
            http,
            url: format!("{}/completion", base_url.trim_end_matches('/')),
            encoding,
        }
    }

    fn request(
        &self,
        messages: &[Message],
        params: &SamplingParams,
        stream: bool,
    ) -> Result<CompletionRequest> {
        Ok(CompletionRequest {
            prompt: build_prompt(&self.encoding, messages)?,
            seed: params.seed,
            temperature: params.temperature,
            cache_prompt: true,
            stream,
            n_predict: params.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionClient for LlamaCppClient {
    fn name(&self) -> &'static str {
        "llamacpp"
    }

    async fn generate(&self, messages: &[Message], params: &SamplingParams) -> Result<String> {
        let request = self.request(messages, params, false)?;
        let response = post_json(&self.http, &self.url, &request).await?;
        let body: CompletionResponse = response.json().await.map_err(|e| {
            tracing::error!("Failed to parse completion response: {}", e);
            LlmHostError::Protocol(format!("failed to decode response: {}", e))
        })?;
        body.check_error()?;
        body.log_timings();
        Ok(body.content)
    }

    async fn generate_streaming(
        &self,
        messages: &[Message],
        params: &SamplingParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        let request = match self.request(messages, params, true) {
            Ok(request) => request,
            Err(error) => {
                return StreamOutcome {
                    text: String::new(),
                    error: Some(error),
                }
            }
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return StreamOutcome { text: String::new(), error: Some(LlmHostError::Cancelled.into()) };
            }
            response = post_json(&self.http, &self.url, &request) => response,
        };
        match response {
            Ok(response) => {
                drive_line_stream(response.bytes_stream(), &tx, &cancel, parse_stream_line).await
            }
            Err(error) => StreamOutcome {
                text: String::new(),
                error: Some(error),
            },
        }
    }
}
