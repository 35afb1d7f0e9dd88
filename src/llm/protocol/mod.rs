//! Wire protocols spoken to the inference engine
//!
//! Two interchangeable implementations sit behind [`CompletionClient`]:
//!
//! - [`openai::OpenAiClient`]: the generic chat-completion protocol
//!   (`/v1/chat/completions`), used when the model has no prompt encoding.
//! - [`llamacpp::LlamaCppClient`]: the native completion protocol
//!   (`/completion`), which needs the message list flattened into a single
//!   prompt with the model's literal tokens.
//!
//! The implementation is picked once by [`create_client`] when the session
//! is constructed.

pub mod llamacpp;
pub mod openai;

use crate::error::{LlmHostError, Result};
use crate::llm::{split_stop_marker, Message, PromptEncoding, SamplingParams};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of a streaming generation
///
/// On failure the text received so far is preserved alongside the error.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Concatenation of every fragment forwarded to the caller
    pub text: String,
    /// Set when the stream aborted
    pub error: Option<anyhow::Error>,
}

impl StreamOutcome {
    /// Converts into a `Result`, dropping the partial text on error.
    pub fn into_result(self) -> Result<String> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.text),
        }
    }

    fn failed(text: String, error: anyhow::Error) -> Self {
        Self {
            text,
            error: Some(error),
        }
    }
}

/// Common contract of both wire protocols
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Short protocol name for logs
    fn name(&self) -> &'static str;

    /// Generates a full reply in one request.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the request fails or the response is
    /// malformed, or a prompt sequence error before any network I/O.
    async fn generate(&self, messages: &[Message], params: &SamplingParams) -> Result<String>;

    /// Generates a reply, forwarding fragments on `tx` as they arrive.
    ///
    /// Returns the concatenated text. Cancellation via `cancel` or a closed
    /// receiver unwinds promptly with [`LlmHostError::Cancelled`].
    async fn generate_streaming(
        &self,
        messages: &[Message],
        params: &SamplingParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamOutcome;
}

/// Create the protocol client for a session
///
/// A prompt encoding selects the native protocol, its absence the generic
/// chat-completion protocol.
pub fn create_client(
    base_url: &str,
    encoding: Option<PromptEncoding>,
    http: reqwest::Client,
) -> Box<dyn CompletionClient> {
    match encoding {
        Some(encoding) => Box::new(llamacpp::LlamaCppClient::new(base_url, encoding, http)),
        None => Box::new(openai::OpenAiClient::new(base_url, http)),
    }
}

/// POST a JSON body and fail on HTTP error statuses.
pub(crate) async fn post_json<T: serde::Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &str,
    body: &T,
) -> Result<reqwest::Response> {
    let response = http.post(url).json(body).send().await.map_err(|e| {
        tracing::warn!("Request to {} failed: {}", url, e);
        LlmHostError::Protocol(format!("request to {} failed: {}", url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!("Engine returned error {}: {}", status, error_text);
        return Err(LlmHostError::Protocol(format!(
            "engine returned error {}: {}",
            status, error_text
        ))
        .into());
    }
    Ok(response)
}

/// What a single stream line means to the reader loop
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineEvent {
    /// Nothing to forward
    Skip,
    /// Forward this fragment and keep reading
    Fragment(String),
    /// End of stream, optionally with a last fragment
    Done(Option<String>),
}

/// Drive a newline-delimited response body to completion.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across chunks decode correctly. A residual line left
/// at EOF is handed to `parse` as the final record. A fragment ending with a
/// known stop marker ends the stream; only the text before the marker is
/// forwarded. Sends to a full channel give way to cancellation.
pub(crate) async fn drive_line_stream<S, P>(
    byte_stream: S,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    parse: P,
) -> StreamOutcome
where
    S: Stream<Item = reqwest::Result<Bytes>>,
    P: Fn(&str) -> Result<LineEvent>,
{
    tokio::pin!(byte_stream);

    let mut buffer: Vec<u8> = Vec::new();
    let mut text = String::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                return StreamOutcome::failed(text, LlmHostError::Cancelled.into());
            }
            chunk = byte_stream.next() => chunk,
        };

        let eof = match chunk {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                false
            }
            Some(Err(e)) => {
                return StreamOutcome::failed(
                    text,
                    LlmHostError::Protocol(format!("failed to read engine response: {}", e))
                        .into(),
                );
            }
            None => true,
        };

        let mut lines: Vec<Vec<u8>> = Vec::new();
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            lines.push(buffer.drain(..=pos).collect());
        }
        if eof && !buffer.is_empty() {
            lines.push(std::mem::take(&mut buffer));
        }

        for raw in lines {
            let line = match std::str::from_utf8(&raw) {
                Ok(s) => s.trim(),
                Err(e) => {
                    return StreamOutcome::failed(
                        text,
                        LlmHostError::Protocol(format!("invalid UTF-8 in stream: {}", e)).into(),
                    );
                }
            };
            if line.is_empty() {
                continue;
            }
            let event = match parse(line) {
                Ok(event) => event,
                Err(err) => return StreamOutcome::failed(text, err),
            };
            let (fragment, done) = match event {
                LineEvent::Skip => (None, false),
                LineEvent::Fragment(f) => (Some(f), false),
                LineEvent::Done(f) => (f, true),
            };
            if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
                let (fragment, stop) = match split_stop_marker(&fragment) {
                    Some(head) => (head.to_string(), true),
                    None => (fragment, false),
                };
                if !fragment.is_empty() {
                    tracing::trace!(fragment = %fragment, "stream fragment");
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => false,
                        res = tx.send(fragment.clone()) => res.is_ok(),
                    };
                    if !sent {
                        return StreamOutcome::failed(text, LlmHostError::Cancelled.into());
                    }
                    text.push_str(&fragment);
                }
                if stop {
                    return StreamOutcome { text, error: None };
                }
            }
            if done {
                return StreamOutcome { text, error: None };
            }
        }

        if eof {
            return StreamOutcome { text, error: None };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = reqwest::Result<Bytes>> {
        let items: Vec<reqwest::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        futures::stream::iter(items)
    }

    fn echo(line: &str) -> Result<LineEvent> {
        match line {
            "END" => Ok(LineEvent::Done(None)),
            "BAD" => Err(LlmHostError::Protocol("bad line".into()).into()),
            other => Ok(LineEvent::Fragment(other.to_string())),
        }
    }

    #[tokio::test]
    async fn test_drive_lines_split_across_chunks() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome =
            drive_line_stream(chunks(&[b"hel", b"lo\nwor", b"ld\n"]), &tx, &cancel, echo).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "helloworld");
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(rx.recv().await.unwrap(), "world");
    }

    #[tokio::test]
    async fn test_drive_lines_residual_line_at_eof() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome = drive_line_stream(chunks(&[b"a\nb"]), &tx, &cancel, echo).await;
        assert_eq!(outcome.text, "ab");
    }

    #[tokio::test]
    async fn test_drive_lines_multibyte_split() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let bytes = "é\n".as_bytes();
        let outcome =
            drive_line_stream(chunks(&[&bytes[..1], &bytes[1..]]), &tx, &cancel, echo).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "é");
    }

    #[tokio::test]
    async fn test_drive_lines_error_keeps_partial_text() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome =
            drive_line_stream(chunks(&[b"one\nBAD\nthree\n"]), &tx, &cancel, echo).await;
        assert_eq!(outcome.text, "one");
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_drive_lines_stop_marker_ends_stream() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome =
            drive_line_stream(chunks(&[b"hi\n<|eot_id|>\nafter\n"]), &tx, &cancel, echo).await;
        assert_eq!(outcome.text, "hi");
        assert_eq!(rx.recv().await.unwrap(), "hi");
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drive_lines_trailing_stop_marker_is_stripped() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome =
            drive_line_stream(chunks(&[b"hi \nok<|eot_id|>\nafter\n"]), &tx, &cancel, echo)
                .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.text, "hiok");
        assert_eq!(rx.recv().await.unwrap(), "hi");
        assert_eq!(rx.recv().await.unwrap(), "ok");
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drive_lines_full_channel_yields_to_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let body: Vec<u8> = (0..100).flat_map(|i| format!("w{}\n", i).into_bytes()).collect();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drive_line_stream(chunks(&[&body]), &tx, &cancel, echo),
        )
        .await
        .expect("stream must unwind once cancelled");
        canceller.await.unwrap();
        assert_eq!(outcome.text, "w0");
        assert!(matches!(
            outcome.error.unwrap().downcast_ref::<LlmHostError>(),
            Some(LlmHostError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drive_lines_cancelled() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = futures::stream::pending::<reqwest::Result<Bytes>>();
        let outcome = drive_line_stream(pending, &tx, &cancel, echo).await;
        let err = outcome.error.expect("expected cancellation");
        assert!(matches!(
            err.downcast_ref::<LlmHostError>(),
            Some(LlmHostError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drive_lines_done_stops_reading() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome = drive_line_stream(chunks(&[b"x\nEND\ny\n"]), &tx, &cancel, echo).await;
        assert_eq!(outcome.text, "x");
    }
}
