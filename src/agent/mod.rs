//! Agent CLI process management.
//!
//! Spawns the external agent binary in non-interactive mode inside a task
//! workspace and turns its stdout into a stream of parsed events.

pub mod events;

pub use events::{AgentEvent, ResultEvent, Usage};

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Stdout chunk capacity: events can be very large (whole-file diffs), so
/// read with a 1 MiB buffer.
const STDOUT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// One parsed stdout line plus the verbatim text it came from.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub event: AgentEvent,
    pub raw: String,
}

/// Handle to a running agent process.
///
/// `kill()` signals termination when cancelling a task; the executor keeps
/// draining events until EOF and then calls `wait()` to reap the child.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    child: Arc<Mutex<Option<Child>>>,
    stderr_task: Arc<Mutex<Option<tokio::task::JoinHandle<String>>>>,
    killed: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Signal the underlying process to terminate. Idempotent.
    pub async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill agent process: {}", e);
            } else {
                info!("agent process killed");
            }
        }
    }

    /// Whether `kill()` was requested at any point.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Reap the child and return its exit code (None when killed by signal).
    pub async fn wait(&self) -> Result<Option<i32>> {
        let child = self.child.lock().await.take();
        match child {
            Some(mut child) => {
                let status = child
                    .wait()
                    .await
                    .map_err(|e| Error::Executor(format!("wait for agent: {}", e)))?;
                Ok(status.code())
            }
            None => Ok(None),
        }
    }

    /// Collected stderr, available once per handle.
    pub async fn read_stderr(&self) -> String {
        let task = self.stderr_task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

/// Launches the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    cli_path: String,
}

impl AgentLauncher {
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Spawn the agent in `directory` with the composed prompt and return
    /// a stream of parsed events plus a handle for cancellation.
    ///
    /// The child runs non-interactively: permission prompts disabled,
    /// structured event-stream output, one event per line. The environment
    /// is sanitised so the agent does not detect re-entry and does not
    /// phone telemetry home.
    pub async fn launch(
        &self,
        directory: &Path,
        prompt: &str,
    ) -> Result<(mpsc::Receiver<AgentOutput>, ProcessHandle)> {
        let (tx, rx) = mpsc::channel(256);

        let mut cmd = Command::new(&self.cli_path);
        cmd.current_dir(directory)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .arg(prompt)
            .env_remove("CLAUDECODE")
            .env_remove("CLAUDE_CODE_ENTRYPOINT")
            .env("DISABLE_TELEMETRY", "1")
            .env("DISABLE_ERROR_REPORTING", "1");

        info!(directory = %directory.display(), "spawning agent CLI");

        let mut child = cmd.spawn().map_err(|e| {
            error!("failed to spawn agent CLI: {}", e);
            Error::Executor(format!(
                "failed to spawn agent CLI: {}. Is it installed at '{}'?",
                e, self.cli_path
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Executor("failed to capture agent stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Executor("failed to capture agent stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        tokio::spawn(async move {
            let reader = BufReader::with_capacity(STDOUT_BUFFER_CAPACITY, stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                let event = events::parse_line(&line);
                debug!("agent event: {:?}", event.summary());
                if tx.send(AgentOutput { event, raw: line }).await.is_err() {
                    debug!("receiver dropped, stopping agent event stream");
                    break;
                }
            }
        });

        let handle = ProcessHandle {
            child: Arc::new(Mutex::new(Some(child))),
            stderr_task: Arc::new(Mutex::new(Some(stderr_task))),
            killed: Arc::new(AtomicBool::new(false)),
        };

        Ok((rx, handle))
    }
}
