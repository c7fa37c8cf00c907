//! Task storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database with per-task log entries
//!
//! All task-state mutations funnel through [`TaskStore::update_task`]; the
//! state machine and field bookkeeping live in [`apply_patch`] so both
//! backends enforce identical invariants.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "review" => Some(TaskStatus::Review),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are immutable except via retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the agent is prompted for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Execute,
    Plan,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Execute => "execute",
            TaskMode::Plan => "plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute" => Some(TaskMode::Execute),
            "plan" => Some(TaskMode::Plan),
            _ => None,
        }
    }
}

/// Scheduling priority, ordered low -> urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    /// Numeric rank persisted for index-friendly ordering.
    pub fn rank(&self) -> i64 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
            TaskPriority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            3 => TaskPriority::Urgent,
            _ => TaskPriority::Medium,
        }
    }
}

/// A task: one agent invocation inside an isolated workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    /// Override of the base repository for this task's workspace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Branch and working directory, assigned at dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Log entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogSeverity::Info),
            "warn" => Some(LogSeverity::Warn),
            "error" => Some(LogSeverity::Error),
            _ => None,
        }
    }
}

/// Append-only per-task log entry. Never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: i64,
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
    /// Verbatim agent event line, when the entry mirrors one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update applied through the single mutation funnel.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub mode: Option<TaskMode>,
    pub branch: Option<String>,
    pub working_directory: Option<String>,
    pub output: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: Option<f64>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Format a timestamp with fixed width so lexicographic order in the
/// database equals chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Whether the state machine allows `from -> to`.
///
/// ```text
/// PENDING -> IN_PROGRESS | CANCELLED
/// IN_PROGRESS -> COMPLETED | FAILED | CANCELLED
/// FAILED -> PENDING   (retry)
/// REVIEW -> PENDING   (plan approval)
/// ```
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Failed, Pending)
            | (Review, Pending)
    )
}

/// Validate creation fields: title 1-200 chars, non-empty prompt.
/// Dependency existence is checked by the backend against live state.
pub(crate) fn validate_new_task(new: &NewTask) -> Result<()> {
    let title_len = new.title.chars().count();
    if title_len == 0 || title_len > 200 {
        return Err(Error::Validation(
            "title must be 1-200 characters".to_string(),
        ));
    }
    if new.prompt.is_empty() {
        return Err(Error::Validation("prompt must not be empty".to_string()));
    }
    Ok(())
}

/// Apply a patch to a task in place, enforcing the state machine.
///
/// Status bookkeeping:
/// - entering `IN_PROGRESS` stamps `started_at`
/// - entering a terminal state stamps `completed_at`
/// - entering `PENDING` (retry / approval) clears error, exit_code, token
///   usage, cost and `completed_at`; re-entering `PENDING` repeats the
///   clearing so a second retry has the same effect as the first
///
/// A patch without a status change is rejected outright on terminal tasks.
pub(crate) fn apply_patch(task: &mut Task, patch: TaskPatch) -> Result<()> {
    let now = Utc::now();

    match patch.status {
        Some(next) => {
            let current = task.status;
            if next == current {
                if current.is_terminal() {
                    return Err(Error::StateConflict {
                        from: current,
                        to: next,
                    });
                }
                if next == TaskStatus::Pending {
                    clear_run_results(task);
                }
            } else {
                if !transition_allowed(current, next) {
                    return Err(Error::StateConflict {
                        from: current,
                        to: next,
                    });
                }
                match next {
                    TaskStatus::InProgress => task.started_at = Some(now),
                    TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                        task.completed_at = Some(now)
                    }
                    TaskStatus::Pending => {
                        clear_run_results(task);
                        task.started_at = None;
                    }
                    TaskStatus::Review => {}
                }
                task.status = next;
            }
        }
        None => {
            if task.status.is_terminal() {
                return Err(Error::StateConflict {
                    from: task.status,
                    to: task.status,
                });
            }
        }
    }

    if let Some(mode) = patch.mode {
        task.mode = mode;
    }
    if let Some(branch) = patch.branch {
        task.branch = Some(branch);
    }
    if let Some(wd) = patch.working_directory {
        task.working_directory = Some(wd);
    }
    if let Some(output) = patch.output {
        task.output = Some(output);
    }
    if let Some(plan) = patch.plan {
        task.plan = Some(plan);
    }
    if let Some(error) = patch.error {
        task.error = Some(error);
    }
    if let Some(code) = patch.exit_code {
        task.exit_code = Some(code);
    }
    if let Some(tokens) = patch.input_tokens {
        task.input_tokens = Some(tokens);
    }
    if let Some(tokens) = patch.output_tokens {
        task.output_tokens = Some(tokens);
    }
    if let Some(cost) = patch.cost {
        task.cost = Some(cost);
    }

    Ok(())
}

fn clear_run_results(task: &mut Task) {
    task.error = None;
    task.exit_code = None;
    task.input_tokens = None;
    task.output_tokens = None;
    task.cost = None;
    task.completed_at = None;
}

/// Ranking used for `get_next_pending_task` and pending listings:
/// priority descending, then created_at ascending, then id ascending.
pub(crate) fn ranking_key(task: &Task) -> (i64, DateTime<Utc>, i64) {
    (-task.priority.rank(), task.created_at, task.id)
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a task with status `PENDING`. Every id in `depends_on` must
    /// reference an existing task.
    async fn create_task(&self, new: NewTask) -> Result<Task>;

    /// Create several tasks atomically: all persist or none do.
    async fn create_tasks_batch(&self, batch: Vec<NewTask>) -> Result<Vec<Task>>;

    /// Get a single task by id.
    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    /// List tasks. A `PENDING` filter returns scheduler ranking order;
    /// anything else is ordered by created_at ascending.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    /// Apply a partial update; rejects transitions the state machine
    /// does not allow.
    async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task>;

    /// Count tasks in a given status (scheduler admission checks).
    async fn count_tasks(&self, status: TaskStatus) -> Result<usize>;

    /// The single best-ranked pending task, if any.
    async fn get_next_pending_task(&self) -> Result<Option<Task>>;

    /// Append a log entry for a task.
    async fn add_log(
        &self,
        task_id: i64,
        severity: LogSeverity,
        message: &str,
        raw: Option<&str>,
    ) -> Result<LogEntry>;

    /// Logs for a task, ascending by timestamp then insertion id.
    async fn get_task_logs(&self, task_id: i64) -> Result<Vec<LogEntry>>;

    /// Delete a task and (cascade) its log entries.
    async fn delete_task(&self, id: i64) -> Result<()>;

    /// Boot repair: every `IN_PROGRESS` task is forced back to `PENDING`
    /// with `started_at` cleared. Returns the number of repaired tasks.
    /// Must run before the scheduler starts.
    async fn recover(&self) -> Result<usize>;
}
