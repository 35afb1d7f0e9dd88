//! Generic chat-completion protocol
//!
//! Speaks the `/v1/chat/completions` dialect understood by llama-server,
//! llamafile and most hosted OpenAI-compatible endpoints. Streaming replies
//! arrive as `data: <json>` lines terminated by `data: [DONE]`.

use super::{drive_line_stream, post_json, CompletionClient, LineEvent, StreamOutcome};
use crate::error::{LlmHostError, Result};
use crate::llm::{Message, SamplingParams};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Request body for `/v1/chat/completions`
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'static str,
    stream: bool,
    messages: &'a [Message],
    seed: i64,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl<'a> ChatRequest<'a> {
    fn new(messages: &'a [Message], params: &SamplingParams, stream: bool) -> Self {
        Self {
            // llama-server serves whatever model it was started with.
            model: "ignored",
            stream,
            messages,
            seed: params.seed,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the generic chat-completion protocol
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
}

impl OpenAiClient {
    /// Creates a client for the server at `base_url` (e.g. `http://localhost:8031`)
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            http,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
        }
    }
}

/// Interpret one line of the streaming response.
fn parse_stream_line(line: &str) -> Result<LineEvent> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Err(LlmHostError::Protocol(format!(
            "unexpected line, expected \"data: \", got {:?}",
            line
        ))
        .into());
    };
    if data == "[DONE]" {
        return Ok(LineEvent::Done(None));
    }
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
        LlmHostError::Protocol(format!("failed to decode stream record {:?}: {}", data, e))
    })?;
    if chunk.choices.len() != 1 {
        return Err(LlmHostError::Protocol(format!(
            "unexpected number of choices: {}",
            chunk.choices.len()
        ))
        .into());
    }
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(content) if !content.is_empty() => Ok(LineEvent::Fragment(content)),
        _ => Ok(LineEvent::Skip),
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, messages: &[Message], params: &SamplingParams) -> Result<String> {
        let request = ChatRequest::new(messages, params, false);
        let response = post_json(&self.http, &self.url, &request).await?;
        let body: ChatResponse = response.json().await.map_err(|e| {
            tracing::error!("Failed to parse chat response: {}", e);
            LlmHostError::Protocol(format!("failed to decode response: {}", e))
        })?;

        if body.choices.len() != 1 {
            return Err(LlmHostError::Protocol(format!(
                "unexpected number of choices: {}",
                body.choices.len()
            ))
            .into());
        }
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmHostError::Protocol("unexpected number of choices: 0".into()))?;
        tracing::debug!(finish_reason = ?choice.finish_reason, "chat completion finished");
        Ok(choice.message.content)
    }

    async fn generate_streaming(
        &self,
        messages: &[Message],
        params: &SamplingParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        let request = ChatRequest::new(messages, params, true);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_max_tokens_when_unset() {
        let messages = vec![Message::user("hi")];
        let params = SamplingParams::default();
        let json = serde_json::to_value(ChatRequest::new(&messages, &params, true)).unwrap();
        assert_eq!(json["model"], "ignored");
        assert_eq!(json["stream"], true);
        assert_eq!(json["seed"], 1);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_request_includes_max_tokens() {
        let messages = vec![Message::user("hi")];
        let params = SamplingParams {
            max_tokens: Some(64),
            ..Default::default()
        };
        let json = serde_json::to_value(ChatRequest::new(&messages, &params, false)).unwrap();
        assert_eq!(json["max_tokens"], 64);
    }

    #[test]
    fn test_parse_stream_line_fragment() {
        let event =
            parse_stream_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(event, LineEvent::Fragment("hi".to_string()));
    }

    #[test]
    fn test_parse_stream_line_done() {
        assert_eq!(parse_stream_line("data: [DONE]").unwrap(), LineEvent::Done(None));
    }

    #[test]
    fn test_parse_stream_line_empty_delta_skipped() {
        let event = parse_stream_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
            .unwrap();
        assert_eq!(event, LineEvent::Skip);
    }

    #[test]
    fn test_parse_stream_line_requires_data_prefix() {
        let err = parse_stream_line(r#"{"choices":[]}"#).unwrap_err();
        assert!(err.to_string().contains("expected \"data: \""));
    }

    #[test]
    fn test_parse_stream_line_rejects_multiple_choices() {
        let err = parse_stream_line(
            r#"data: {"choices":[{"delta":{"content":"a"}},{"delta":{"content":"b"}}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unexpected number of choices"));
    }

    #[test]
    fn test_parse_stream_line_rejects_bad_json() {
        assert!(parse_stream_line("data: {not json").is_err());
    }

    #[test]
    fn test_url_joins_base() {
        let client = OpenAiClient::new("http://localhost:8031/", reqwest::Client::new());
        assert_eq!(client.url, "http://localhost:8031/v1/chat/completions");
    }
}
