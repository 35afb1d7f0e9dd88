//! Image generation engine session
//!
//! The image engine is an HTTP server taking `POST /` with
//! `{"message", "steps", "seed"}` and answering `{"image": "<base64 PNG>"}`.
//! It is either spawned from a configured command (with `--port P`
//! appended) or reached at a remote `host:port`.
//!
//! Readiness is probed by generating a tiny image with a single step; once
//! the engine answers, the configured step count is used.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::is_host_port;
use crate::error::{LlmHostError, Result};
use crate::llm::session::{http_client, HEALTH_POLL_INTERVAL};
use crate::process::{find_free_port, ProcessHandle, DEFAULT_GRACE_PERIOD};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Steps used once the engine is ready
pub const DEFAULT_STEPS: u32 = 8;

/// Parameters for [`ImageSession::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOptions {
    /// Program and arguments starting the engine; `--port P` is appended
    pub command: Vec<String>,
    /// `host:port` of an already running engine; wins over `command`
    pub remote: Option<String>,
    pub steps: u32,
    pub grace_period: Duration,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            remote: None,
            steps: DEFAULT_STEPS,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    message: &'a str,
    steps: u32,
    seed: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageResponse {
    image: String,
}

/// Supervised image generation engine
#[derive(Debug)]
pub struct ImageSession {
    url: String,
    http: reqwest::Client,
    process: Option<ProcessHandle>,
    steps: AtomicU32,
    loading: AtomicBool,
    closed: AtomicBool,
}

impl ImageSession {
    /// Bring up the engine and wait until a probe image succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Config` without a command or remote, `Startup` when the
    /// engine exits first and `Cancelled` when `cancel` fires first.
    pub async fn start(
        opts: &ImageOptions,
        cache_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = http_client()?;
        let (url, process) = match (&opts.remote, opts.command.is_empty()) {
            (Some(remote), _) => {
                if !is_host_port(remote) {
                    return Err(LlmHostError::Config(format!(
                        "invalid remote {:?}; use form 'host:port'",
                        remote
                    ))
                    .into());
                }
                (format!("http://{}/", remote), None)
            }
            (None, true) => {
                return Err(LlmHostError::Config(
                    "image_gen needs either a command or a remote".to_string(),
                )
                .into());
            }
            (None, false) => {
                tokio::fs::create_dir_all(cache_dir).await?;
                let port = find_free_port(0)?;
                let mut cmd = opts.command.clone();
                cmd.push("--port".to_string());
                cmd.push(port.to_string());
                tracing::debug!(command = ?cmd, "spawning image engine");
                let process =
                    ProcessHandle::spawn(&cmd, cache_dir, &cache_dir.join("image_gen.log"))?
                        .with_grace_period(opts.grace_period);
                (format!("http://localhost:{}/", port), Some(process))
            }
        };

        let session = Self {
            url,
            http,
            process,
            steps: AtomicU32::new(1),
            loading: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        };
        tracing::info!(
            state = "started",
            url = %session.url,
            "image engine starting, downloading weights can take several minutes"
        );

        if let Err(e) = session.wait_ready(&cancel).await {
            if let Some(process) = &session.process {
                process.terminate().await;
                let _ = process.wait().await;
            }
            return Err(e);
        }

        session.steps.store(opts.steps.max(1), Ordering::SeqCst);
        session.loading.store(false, Ordering::SeqCst);
        tracing::info!(state = "ready", "image engine ready");
        Ok(session)
    }

    async fn exited(&self) -> String {
        match &self.process {
            Some(p) => {
                p.exited().await;
                match p.wait().await {
                    Ok(()) => "image engine exited".to_string(),
                    Err(e) => e.to_string(),
                }
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
                reason = self.exited() => {
                    return Err(LlmHostError::Startup(format!("failed to start: {}", reason)).into());
                }
                probe = self.generate("cat", 1) => {
                    if probe.is_ok() {
                        return Ok(());
                    }
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
                reason = self.exited() => {
                    return Err(LlmHostError::Startup(format!("failed to start: {}", reason)).into());
                }
                _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Steps used for the next generation
    pub fn steps(&self) -> u32 {
        self.steps.load(Ordering::SeqCst)
    }

    /// Generate a PNG for `prompt`.
    ///
    /// A non-zero seed gives deterministic output without strong guarantees.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Protocol` when the request fails or the reply
    /// is not a base64-encoded PNG.
    pub async fn generate(&self, prompt: &str, seed: i64) -> Result<Vec<u8>> {
        let loading = self.loading.load(Ordering::SeqCst);
        let start = Instant::now();
        let request = ImageRequest {
            message: prompt,
            steps: self.steps(),
            seed,
        };
        let result = self.request(&request).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(png) => tracing::info!(prompt, duration_ms, bytes = png.len(), "image generated"),
            // The readiness loop would otherwise flood the log.
            Err(e) if loading => tracing::debug!(prompt, duration_ms, error = %e, "image probe"),
            Err(e) => tracing::error!(prompt, duration_ms, error = %e, "image generation failed"),
        }
        result
    }

    async fn request(&self, request: &ImageRequest<'_>) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmHostError::Protocol(format!("image request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmHostError::Protocol(format!(
                "image engine returned error {}: {}",
                status, body
            ))
            .into());
        }
        let body: ImageResponse = response.json().await.map_err(|e| {
            LlmHostError::Protocol(format!("failed to decode image response: {}", e))
        })?;
        decode_png(&body.image)
    }

    /// Stop the engine; no-op for a remote one.
    ///
    /// # Errors
    ///
    /// Returns `ProcessExited` when the engine had died on its own.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(state = "terminating", "image engine");
        match &self.process {
            Some(process) => {
                process.terminate().await;
                process.wait().await
            }
            None => Ok(()),
        }
    }
}

fn decode_png(encoded: &str) -> Result<Vec<u8>> {
    let png = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| LlmHostError::Protocol(format!("invalid base64 image: {}", e)))?;
    if !png.starts_with(PNG_SIGNATURE) {
        return Err(LlmHostError::Protocol("image is not a PNG".to_string()).into());
    }
    Ok(png)
}
