//! Process executor: runs exactly one task end-to-end.
//!
//! Workspace provisioning, agent launch, event draining, and finalisation
//! for a single task. The executor never touches the task store or the
//! broadcast hub directly; everything it learns flows to the scheduler
//! through an [`ExecutorMessage`] channel, which keeps it testable in
//! isolation and preserves per-task event ordering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::agent::{AgentEvent, AgentLauncher, ResultEvent};
use crate::store::{Task, TaskMode, TaskStatus};
use crate::workspace::{Workspace, WorkspaceManager};

/// Marker the plan-mode preamble asks the agent to emit between its plan
/// and the implementation that follows.
pub const PLAN_SENTINEL: &str = "---PLAN END---";

const PLAN_PREAMBLE: &str = "Before making any changes, write out a complete implementation plan \
for the task below. End the plan with a line containing exactly ---PLAN END--- \
and only continue with the implementation after that line.\n\n";

/// Version-control finalisation is prompt-level automation: the agent
/// commits, merges, and pushes itself. The executor only provisions the
/// workspace and must not repeat these steps.
const WORKFLOW_SUFFIX: &str = "\n\nWhen the task is done: commit your work on the current branch, \
merge the branch into the base branch, and push the result.";

/// Messages the executor reports back to its caller.
#[derive(Debug)]
pub enum ExecutorMessage {
    /// Workspace provisioned; branch and directory were assigned.
    Workspace {
        task_id: i64,
        branch: String,
        working_directory: String,
    },
    /// One parsed agent event, in emission order.
    Output {
        task_id: i64,
        event: AgentEvent,
        raw: String,
    },
    /// Out-of-band executor warning (e.g. log mirror failure).
    Warning { task_id: i64, message: String },
    /// Terminal result; always the executor's last message for a task.
    Complete { task_id: i64, result: TaskResult },
}

/// Terminal outcome of a single task run.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: Option<f64>,
}

impl TaskResult {
    fn failed(exit_code: i32, error: String) -> Self {
        Self {
            status: TaskStatus::Failed,
            exit_code: Some(exit_code),
            output: None,
            plan: None,
            error: Some(error),
            input_tokens: None,
            output_tokens: None,
            cost: None,
        }
    }
}

/// Compose the prompt sent to the agent for a task.
pub fn compose_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    if task.mode == TaskMode::Plan {
        prompt.push_str(PLAN_PREAMBLE);
    }
    prompt.push_str(&task.prompt);
    prompt.push_str(WORKFLOW_SUFFIX);
    prompt
}

/// Split plan-mode output at the first sentinel occurrence: the part before
/// is the plan, the remainder the implementation output. Without a sentinel
/// the whole text is the plan.
pub fn split_plan(text: &str) -> (Option<String>, Option<String>) {
    match text.split_once(PLAN_SENTINEL) {
        Some((plan, output)) => (
            Some(plan.trim_end().to_string()),
            Some(output.trim_start().to_string()),
        ),
        None => (Some(text.to_string()), None),
    }
}

pub struct TaskExecutor {
    launcher: AgentLauncher,
    workspaces: WorkspaceManager,
    log_dir: PathBuf,
    /// task id -> running process, for cancellation. Entries are removed by
    /// `cancel` or when the run finishes, whichever comes first.
    active: Mutex<HashMap<i64, crate::agent::ProcessHandle>>,
}

impl TaskExecutor {
    pub fn new(launcher: AgentLauncher, workspaces: WorkspaceManager, log_dir: PathBuf) -> Self {
        Self {
            launcher,
            workspaces,
            log_dir,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Number of registered running processes.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Best-effort cancellation: signal the registered process and remove
    /// it from the active map. Safe to call on unknown ids; returns whether
    /// a process was actually signalled.
    pub async fn cancel(&self, task_id: i64) -> bool {
        let handle = self.active.lock().await.remove(&task_id);
        match handle {
            Some(handle) => {
                info!(task_id, "cancelling running task");
                handle.kill().await;
                true
            }
            None => false,
        }
    }

    /// Run a task to completion. Always ends with an
    /// [`ExecutorMessage::Complete`], whatever happens along the way.
    pub async fn run_task(&self, task: Task, sink: mpsc::Sender<ExecutorMessage>) {
        let task_id = task.id;

        let workspace = match self
            .workspaces
            .create_workspace(task_id, &task.title, task.repo_path.as_deref().map(Path::new))
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                // The agent never ran.
                let _ = sink
                    .send(ExecutorMessage::Complete {
                        task_id,
                        result: TaskResult::failed(1, e.to_string()),
                    })
                    .await;
                return;
            }
        };

        let _ = sink
            .send(ExecutorMessage::Workspace {
                task_id,
                branch: workspace.branch.clone(),
                working_directory: workspace.path.to_string_lossy().to_string(),
            })
            .await;

        let prompt = compose_prompt(&task);

        let (mut events, handle) = match self.launcher.launch(&workspace.path, &prompt).await {
            Ok(pair) => pair,
            Err(e) => {
                self.remove_workspace_quiet(&workspace).await;
                let _ = sink
                    .send(ExecutorMessage::Complete {
                        task_id,
                        result: TaskResult::failed(1, e.to_string()),
                    })
                    .await;
                return;
            }
        };

        self.active.lock().await.insert(task_id, handle.clone());

        let mut log_file = self.open_log_file(task_id).await;
        let mut log_write_failed = false;
        let mut assistant_output: Vec<String> = Vec::new();
        let mut terminal: Option<ResultEvent> = None;

        while let Some(out) = events.recv().await {
            if let Some(file) = log_file.as_mut() {
                let mut line = out.raw.clone();
                line.push('\n');
                if file.write_all(line.as_bytes()).await.is_err() && !log_write_failed {
                    log_write_failed = true;
                    let _ = sink
                        .send(ExecutorMessage::Warning {
                            task_id,
                            message: "failed to mirror agent output to log file".to_string(),
                        })
                        .await;
                }
            }

            if let Some(text) = out.event.assistant_text() {
                assistant_output.push(text);
            }
            if let Some(res) = out.event.as_result() {
                terminal = Some(res.clone());
            }

            let _ = sink
                .send(ExecutorMessage::Output {
                    task_id,
                    event: out.event,
                    raw: out.raw,
                })
                .await;
        }

        let exit_code = handle.wait().await.ok().flatten();
        let stderr = handle.read_stderr().await;
        let cancelled = handle.was_killed();

        self.active.lock().await.remove(&task_id);

        let final_text = match &terminal {
            Some(res) => res
                .result
                .clone()
                .unwrap_or_else(|| assistant_output.join("\n")),
            None => assistant_output.join("\n"),
        };

        let result = if cancelled {
            self.remove_workspace_quiet(&workspace).await;
            TaskResult {
                status: TaskStatus::Cancelled,
                exit_code,
                output: if final_text.is_empty() {
                    None
                } else {
                    Some(final_text)
                },
                plan: None,
                error: None,
                input_tokens: terminal.as_ref().and_then(|r| r.input_tokens()),
                output_tokens: terminal.as_ref().and_then(|r| r.output_tokens()),
                cost: terminal.as_ref().and_then(|r| r.cost_usd()),
            }
        } else if exit_code == Some(0) {
            let (plan, output) = match task.mode {
                TaskMode::Plan => split_plan(&final_text),
                TaskMode::Execute => (None, Some(final_text)),
            };
            TaskResult {
                status: TaskStatus::Completed,
                exit_code,
                output,
                plan,
                error: None,
                input_tokens: terminal.as_ref().and_then(|r| r.input_tokens()),
                output_tokens: terminal.as_ref().and_then(|r| r.output_tokens()),
                cost: terminal.as_ref().and_then(|r| r.cost_usd()),
            }
        } else {
            self.remove_workspace_quiet(&workspace).await;
            let error = if stderr.trim().is_empty() {
                match exit_code {
                    Some(code) => format!("agent exited with code {} before finishing", code),
                    None => "agent terminated by signal".to_string(),
                }
            } else {
                stderr.trim().to_string()
            };
            TaskResult::failed(exit_code.unwrap_or(1), error)
        };

        let _ = sink
            .send(ExecutorMessage::Complete { task_id, result })
            .await;
    }

    async fn open_log_file(&self, task_id: i64) -> Option<tokio::fs::File> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            warn!(task_id, "failed to create log dir: {}", e);
            return None;
        }
        let path = self.log_dir.join(format!("task-{}.log", task_id));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(task_id, "failed to open log file: {}", e);
                None
            }
        }
    }

    async fn remove_workspace_quiet(&self, workspace: &Workspace) {
        if let Err(e) = self.workspaces.remove_workspace(workspace, true).await {
            warn!(branch = %workspace.branch, "failed to remove workspace: {}", e);
        }
    }
}
