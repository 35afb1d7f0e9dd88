//! Supervision of engine subprocesses
//!
//! [`ProcessHandle`] spawns an inference or image engine, redirects its
//! output to a per-engine log file and exposes its exit as an awaitable
//! event. A background task owns the [`tokio::process::Child`]; the handle
//! talks to it through a watch channel (exit status) and a oneshot channel
//! (kill request).
//!
//! # Termination
//!
//! On Unix, [`ProcessHandle::terminate`] sends `SIGINT` so the engine can
//! flush and exit cleanly, then escalates to `SIGKILL` after the grace
//! period. Elsewhere the child is killed immediately.

use std::net::TcpListener;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::{LlmHostError, Result};

/// Default delay between the polite signal and the forced kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

type ExitSlot = Option<std::result::Result<ExitStatus, String>>;

/// Handle to a running engine subprocess.
///
/// # Examples
///
/// ```no_run
/// use llmhost::process::ProcessHandle;
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let cmd = vec!["llama-server".to_string(), "--port".to_string(), "8031".to_string()];
/// let proc = ProcessHandle::spawn(&cmd, Path::new("/tmp"), Path::new("/tmp/llm.log"))?;
/// proc.terminate().await;
/// proc.wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    status_rx: watch::Receiver<ExitSlot>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    self_terminated: Arc<AtomicBool>,
    grace_period: Duration,
}

impl ProcessHandle {
    /// Spawn `command` (program followed by its arguments) in `working_dir`.
    ///
    /// Both stdout and stderr are appended to `log_path`, which is created
    /// if missing.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Config` for an empty command and
    /// `LlmHostError::Startup` if the log file cannot be opened or the
    /// process cannot be spawned.
    pub fn spawn(command: &[String], working_dir: &Path, log_path: &Path) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| LlmHostError::Config("empty command".to_string()))?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| {
                LlmHostError::Startup(format!(
                    "failed to open log file {}: {}",
                    log_path.display(),
                    e
                ))
            })?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            LlmHostError::Startup(format!("failed to spawn `{}`: {}", command.join(" "), e))
        })?;
        let pid = child.id();
        tracing::info!(program = %program, pid = ?pid, log = %log_path.display(), "process started");

        let (status_tx, status_rx) = watch::channel::<ExitSlot>(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // The kill request also fires when the handle is dropped.
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("kill failed: {}", e);
                    }
                    child.wait().await
                }
            };
            tracing::debug!(pid = ?pid, status = ?status, "process exited");
            let _ = status_tx.send(Some(status.map_err(|e| e.to_string())));
        });

        Ok(Self {
            program: program.clone(),
            pid,
            status_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            self_terminated: Arc::new(AtomicBool::new(false)),
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    /// Overrides the delay before a graceful termination is escalated.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// OS process id, when still known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true once the exit status has been collected
    pub fn has_exited(&self) -> bool {
        self.status_rx.borrow().is_some()
    }

    /// Resolves when the child exits, without consuming the status.
    pub async fn exited(&self) {
        let mut rx = self.status_rx.clone();
        // An Err means the monitor task is gone, which only happens after exit.
        let _ = rx.wait_for(|slot| slot.is_some()).await;
    }

    /// Stop the child, politely first where the platform allows it.
    ///
    /// Safe to call more than once and after the child already exited.
    pub async fn terminate(&self) {
        self.self_terminated.store(true, Ordering::SeqCst);
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                tracing::info!(pid, program = %self.program, "sending SIGINT");
                // SAFETY: pid was obtained from tokio::process::Child and the
                // monitor task has not reaped it yet.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
            }
            if tokio::time::timeout(self.grace_period, self.exited())
                .await
                .is_ok()
            {
                return;
            }
            tracing::warn!(
                pid = ?self.pid,
                grace_period_s = self.grace_period.as_secs(),
                "process ignored SIGINT, killing"
            );
        }

        self.request_kill();
        self.exited().await;
    }

    /// Await the exit and classify it.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::ProcessExited` unless the child exited
    /// successfully or was stopped by [`ProcessHandle::terminate`].
    pub async fn wait(&self) -> Result<()> {
        self.exited().await;
        let slot = self.status_rx.borrow().clone();
        match slot {
            Some(Ok(status)) => {
                classify_exit(&status, self.self_terminated.load(Ordering::SeqCst))
            }
            Some(Err(e)) => {
                Err(LlmHostError::ProcessExited(format!("failed to collect status: {}", e)).into())
            }
            None => Err(LlmHostError::ProcessExited("monitor task ended".to_string()).into()),
        }
    }

    fn request_kill(&self) {
        if let Ok(mut guard) = self.kill_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            tracing::debug!(pid = ?self.pid, "dropping live process handle, killing");
            self.request_kill();
        }
    }
}

fn classify_exit(status: &ExitStatus, self_terminated: bool) -> Result<()> {
    if status.success() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // Engines that trap SIGINT often exit with 128 + SIGINT.
        if self_terminated
            && (status.signal().is_some() || status.code() == Some(128 + libc::SIGINT))
        {
            return Ok(());
        }
    }
    #[cfg(not(unix))]
    {
        if self_terminated {
            return Ok(());
        }
    }

    Err(LlmHostError::ProcessExited(status.to_string()).into())
}

/// Return `preferred` if it can be bound on localhost, else any free port.
///
/// # Errors
///
/// Returns an IO error if no port can be bound at all.
pub fn find_free_port(preferred: u16) -> Result<u16> {
    if preferred != 0 {
        if let Ok(listener) = TcpListener::bind(("localhost", preferred)) {
            return Ok(listener.local_addr()?.port());
        }
    }
    let listener = TcpListener::bind(("localhost", 0))?;
    Ok(listener.local_addr()?.port())
}
