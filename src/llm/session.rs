//! Inference session supervisor
//!
//! A [`Session`] owns one inference engine for its whole life: it finds the
//! binary, fetches the model, spawns the server, waits until `/health`
//! reports ready, then serves prompts through the protocol client picked at
//! construction. A remote engine skips the local steps but still goes
//! through the readiness loop.
//!
//! ```text
//! Uninitialized -> AcquiringBinary -> AcquiringModel -> Starting
//!     -> PollingHealth -> Ready -> Closing -> Closed
//! ```
//!
//! Any failure before `Ready` ends in `Failed`, with the spawned process
//! already terminated.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::is_host_port;
use crate::error::{LlmHostError, Result};
use crate::llm::acquire::{ensure_model, find_engine};
use crate::llm::metrics::Metrics;
use crate::llm::protocol::{create_client, CompletionClient, StreamOutcome};
use crate::llm::{strip_stop_markers, template, KnownModel, Message, SamplingParams};
use crate::process::{find_free_port, ProcessHandle, DEFAULT_GRACE_PERIOD};

/// Interval between two readiness probes
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the engine's `--version` run
pub const ENGINE_VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Port tried first when spawning a local engine
pub const DEFAULT_LLM_PORT: u16 = 8031;

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AcquiringBinary,
    AcquiringModel,
    Starting,
    PollingHealth,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::AcquiringBinary => "acquiring_binary",
            Self::AcquiringModel => "acquiring_model",
            Self::Starting => "starting",
            Self::PollingHealth => "polling_health",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How the engine is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    LlamaServer,
    Llamafile,
    Remote,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlamaServer => "llama-server",
            Self::Llamafile => "llamafile",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for [`Session::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Model identifier, e.g. `Meta-Llama-3-8B-Instruct-Q5_K_M`
    pub model: String,
    /// `host:port` of an already running engine
    pub remote: Option<String>,
    /// Base URL models are downloaded from
    pub hf_base_url: String,
    /// Delay before a polite shutdown is escalated
    pub grace_period: Duration,
    /// Port tried first for a local engine
    pub preferred_port: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            remote: None,
            hf_base_url: "https://huggingface.co".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            preferred_port: DEFAULT_LLM_PORT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

/// Publishes state transitions and logs them
struct StateTracker {
    tx: watch::Sender<SessionState>,
    model: String,
}

impl StateTracker {
    fn set(&self, state: SessionState) {
        let prev = *self.tx.borrow();
        if prev == state {
            return;
        }
        tracing::info!(model = %self.model, from = %prev, state = %state, "llm state");
        self.tx.send_replace(state);
    }
}

/// Shared HTTP client for engine traffic
///
/// No overall timeout: streamed generations can run for minutes.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("llmhost/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LlmHostError::Http(e).into())
}

/// Supervised inference engine ready to serve prompts
pub struct Session {
    model: String,
    base_url: String,
    backend: Backend,
    client: Box<dyn CompletionClient>,
    http: reqwest::Client,
    process: Option<ProcessHandle>,
    state: StateTracker,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("backend", &self.backend)
            .field("protocol", &self.client.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Bring up an engine for `opts.model` and wait until it is ready.
    ///
    /// # Errors
    ///
    /// - `UnknownModel` when no known model matches
    /// - `Config` for a malformed remote address
    /// - `QuantizationSuffix` or `Acquisition` when the engine or model
    ///   cannot be obtained
    /// - `Startup` when the engine exits before becoming ready
    /// - `Cancelled` when `cancel` fires first
    pub async fn start(
        opts: &SessionOptions,
        known_models: &[KnownModel],
        cache_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (tx, _rx) = watch::channel(SessionState::Uninitialized);
        Self::start_with_state(opts, known_models, cache_dir, cancel, tx).await
    }

    /// Same as [`Session::start`], publishing every transition on `state`.
    pub async fn start_with_state(
        opts: &SessionOptions,
        known_models: &[KnownModel],
        cache_dir: &Path,
        cancel: CancellationToken,
        state: watch::Sender<SessionState>,
    ) -> Result<Self> {
        let tracker = StateTracker {
            tx: state,
            model: opts.model.clone(),
        };
        match Self::bring_up(opts, known_models, cache_dir, &cancel, &tracker).await {
            Ok((base_url, backend, process, client, http)) => {
                tracker.set(SessionState::Ready);
                tracing::info!(
                    model = %opts.model,
                    backend = %backend,
                    url = %base_url,
                    protocol = client.name(),
                    "llm ready"
                );
                Ok(Self {
                    model: opts.model.clone(),
                    base_url,
                    backend,
                    client,
                    http,
                    process,
                    state: tracker,
                })
            }
            Err(e) => {
                tracker.set(SessionState::Failed);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn bring_up(
        opts: &SessionOptions,
        known_models: &[KnownModel],
        cache_dir: &Path,
        cancel: &CancellationToken,
        tracker: &StateTracker,
    ) -> Result<(
        String,
        Backend,
        Option<ProcessHandle>,
        Box<dyn CompletionClient>,
        reqwest::Client,
    )> {
        let known = KnownModel::select(known_models, &opts.model)?;
        let http = http_client()?;

        let (base_url, backend, process) = match &opts.remote {
            Some(remote) => {
                if !is_host_port(remote) {
                    return Err(LlmHostError::Config(format!(
                        "invalid remote {:?}; use form 'host:port'",
                        remote
                    ))
                    .into());
                }
                (format!("http://{}", remote), Backend::Remote, None)
            }
            None => {
                let (base_url, backend, process) =
                    Self::launch_local(opts, known, cache_dir, cancel, tracker, &http).await?;
                (base_url, backend, Some(process))
            }
        };

        tracker.set(SessionState::PollingHealth);
        if let Err(e) = wait_ready(&http, &base_url, process.as_ref(), cancel).await {
            if let Some(process) = &process {
                process.terminate().await;
                let _ = process.wait().await;
            }
            return Err(e);
        }

        let client = create_client(&base_url, known.prompt_encoding.clone(), http.clone());
        Ok((base_url, backend, process, client, http))
    }

    async fn launch_local(
        opts: &SessionOptions,
        known: &KnownModel,
        cache_dir: &Path,
        cancel: &CancellationToken,
        tracker: &StateTracker,
        http: &reqwest::Client,
    ) -> Result<(String, Backend, ProcessHandle)> {
        tracker.set(SessionState::AcquiringBinary);
        let engine = find_engine(cache_dir)?;
        let version = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
            res = tokio::time::timeout(ENGINE_VERSION_TIMEOUT, engine.version()) => {
                res.map_err(|_| {
                    LlmHostError::Acquisition(format!(
                        "{} --version did not finish within {:?}",
                        engine.path.display(),
                        ENGINE_VERSION_TIMEOUT
                    ))
                })??
            }
        };
        tracing::info!(path = %engine.path.display(), version = %version, "engine found");

        tracker.set(SessionState::AcquiringModel);
        let models_dir = cache_dir.join("models");
        let model_file = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
            file = ensure_model(http, &opts.hf_base_url, &opts.model, known, &models_dir) => file?,
        };

        tracker.set(SessionState::Starting);
        let port = find_free_port(opts.preferred_port)?;
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1);
        let mut args = vec![
            "--model".to_string(),
            model_file.display().to_string(),
            "--metrics".to_string(),
            "-ngl".to_string(),
            "9999".to_string(),
            "--threads".to_string(),
            threads.to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if engine.backend == Backend::Llamafile {
            args.push("--nobrowser".to_string());
        }
        let cmd = engine.command(&args);
        tracing::debug!(command = ?cmd, cwd = %cache_dir.display(), "spawning engine");

        let process = ProcessHandle::spawn(&cmd, cache_dir, &cache_dir.join("llm.log"))?
            .with_grace_period(opts.grace_period);
        tracing::info!(pid = ?process.pid(), port, "llm started");
        Ok((format!("http://localhost:{}", port), engine.backend, process))
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.tx.subscribe()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Name of the protocol client in use
    pub fn protocol(&self) -> &'static str {
        self.client.name()
    }

    /// Status string reported by the engine's `/health` endpoint.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the engine cannot be reached.
    pub async fn health(&self) -> Result<String> {
        probe_health(&self.http, &self.base_url).await
    }

    /// Performance counters from `/metrics`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the endpoint fails or the text is
    /// malformed.
    pub async fn metrics(&self) -> Result<Metrics> {
        fetch_metrics(&self.http, &self.base_url).await
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(LlmHostError::Protocol(format!(
                "session for {:?} is {}",
                self.model, other
            ))
            .into()),
        }
    }

    /// Generate a full reply to `msgs`.
    ///
    /// The leading system message is templated first. The reply has its
    /// stop markers stripped and is trimmed.
    ///
    /// # Errors
    ///
    /// Returns the protocol client's error; the session stays usable.
    pub async fn prompt(&self, msgs: &[Message], params: &SamplingParams) -> Result<String> {
        self.ensure_ready()?;
        let msgs = template::apply(msgs, &self.model);
        let start = Instant::now();
        let reply = self.client.generate(&msgs, params).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match reply {
            Ok(reply) => {
                tracing::info!(model = %self.model, duration_ms, "prompt done");
                Ok(strip_stop_markers(&reply))
            }
            Err(e) => {
                tracing::warn!(model = %self.model, duration_ms, error = %e, "prompt failed");
                Err(e)
            }
        }
    }

    /// Generate a reply, forwarding fragments on `tx` as they arrive.
    ///
    /// The outcome text is normalized like [`Session::prompt`]'s reply.
    pub async fn prompt_streaming(
        &self,
        msgs: &[Message],
        params: &SamplingParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        if let Err(e) = self.ensure_ready() {
            return StreamOutcome {
                text: String::new(),
                error: Some(e),
            };
        }
        let msgs = template::apply(msgs, &self.model);
        let start = Instant::now();
        let mut outcome = self
            .client
            .generate_streaming(&msgs, params, tx, cancel)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &outcome.error {
            None => tracing::info!(model = %self.model, duration_ms, "streaming prompt done"),
            Some(e) => tracing::warn!(
                model = %self.model,
                duration_ms,
                error = %e,
                "streaming prompt failed"
            ),
        }
        outcome.text = strip_stop_markers(&outcome.text);
        outcome
    }

    /// Stop the engine and classify its exit.
    ///
    /// A remote session only changes state. Calling `close` again after it
    /// returned is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ProcessExited` when the engine had died on its own.
    pub async fn close(&self) -> Result<()> {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return Ok(());
        }
        self.state.set(SessionState::Closing);
        let result = match &self.process {
            Some(process) => {
                process.terminate().await;
                process.wait().await
            }
            None => Ok(()),
        };
        self.state.set(SessionState::Closed);
        result
    }
}

/// One `/health` probe returning the reported status, `ok` when ready.
///
/// # Errors
///
/// Returns `LlmHostError::Protocol` when the engine cannot be reached or
/// answers with an error.
pub async fn probe_health(http: &reqwest::Client, base_url: &str) -> Result<String> {
    let url = format!("{}/health", base_url);
    let response = http
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| LlmHostError::Protocol(format!("failed to get health response: {}", e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(LlmHostError::Protocol(format!("health returned HTTP {}", status)).into());
    }
    let body: HealthResponse = response.json().await.map_err(|e| {
        LlmHostError::Protocol(format!("failed to decode health response: {}", e))
    })?;
    Ok(body.status)
}

/// Reads and parses `/metrics`.
///
/// # Errors
///
/// Returns `LlmHostError::Protocol` when the endpoint fails or the text is
/// malformed.
pub async fn fetch_metrics(http: &reqwest::Client, base_url: &str) -> Result<Metrics> {
    let url = format!("{}/metrics", base_url);
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| LlmHostError::Protocol(format!("failed to get metrics response: {}", e)))?;
    if !response.status().is_success() {
        return Err(
            LlmHostError::Protocol(format!("metrics returned HTTP {}", response.status())).into(),
        );
    }
    let text = response
        .text()
        .await
        .map_err(|e| LlmHostError::Protocol(format!("failed to read metrics response: {}", e)))?;
    Metrics::parse(&text)
}

async fn process_exit(process: Option<&ProcessHandle>) -> String {
    match process {
        Some(p) => {
            p.exited().await;
            match p.wait().await {
                Ok(()) => "engine exited".to_string(),
                Err(e) => e.to_string(),
            }
        }
        None => std::future::pending().await,
    }
}

/// Poll `/health` until it reports `ok`, racing process exit and `cancel`.
pub(crate) async fn wait_ready(
    http: &reqwest::Client,
    base_url: &str,
    process: Option<&ProcessHandle>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
            reason = process_exit(process) => {
                return Err(LlmHostError::Startup(format!("starting llm server failed: {}", reason)).into());
            }
            probe = probe_health(http, base_url) => {
                match probe {
                    Ok(status) if status == "ok" => return Ok(()),
                    Ok(status) => tracing::trace!(status = %status, "engine not ready"),
                    Err(e) => tracing::trace!(error = %e, "health probe failed"),
                }
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmHostError::Cancelled.into()),
            reason = process_exit(process) => {
                return Err(LlmHostError::Startup(format!("starting llm server failed: {}", reason)).into());
            }
            _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::PollingHealth.to_string(), "polling_health");
        assert_eq!(Backend::Llamafile.to_string(), "llamafile");
    }

    #[test]
    fn test_default_options() {
        let opts = SessionOptions::default();
        assert_eq!(opts.preferred_port, 8031);
        assert_eq!(opts.hf_base_url, "https://huggingface.co");
        assert!(opts.remote.is_none());
    }

    #[tokio::test]
    async fn test_unknown_model_fails_before_anything() {
        let cache = tempfile::TempDir::new().unwrap();
        let opts = SessionOptions {
            model: "nope-Q8_0".to_string(),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(SessionState::Uninitialized);
        let err = Session::start_with_state(&opts, &[], cache.path(), CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlmHostError>(),
            Some(LlmHostError::UnknownModel(_))
        ));
        assert_eq!(*rx.borrow(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_wait_ready_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Nothing listens on port 9 (discard); the cancel wins either way.
        let err = wait_ready(&reqwest::Client::new(), "http://127.0.0.1:9", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlmHostError>(),
            Some(LlmHostError::Cancelled)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_fails_when_process_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 2".to_string()];
        let process = ProcessHandle::spawn(&cmd, dir.path(), &dir.path().join("llm.log")).unwrap();
        let port = find_free_port(0).unwrap();
        let err = wait_ready(
            &reqwest::Client::new(),
            &format!("http://127.0.0.1:{}", port),
            Some(&process),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlmHostError>(),
            Some(LlmHostError::Startup(_))
        ));
    }
}
