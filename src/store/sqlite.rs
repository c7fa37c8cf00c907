//! SQLite-based task store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{
    apply_patch, format_ts, parse_ts, validate_new_task, LogEntry, LogSeverity, NewTask, Task,
    TaskMode, TaskPatch, TaskPriority, TaskStatus, TaskStore,
};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    prompt TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    mode TEXT NOT NULL DEFAULT 'execute',
    priority INTEGER NOT NULL DEFAULT 1,
    depends_on TEXT NOT NULL DEFAULT '[]',
    repo_path TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    branch TEXT,
    working_directory TEXT,
    output TEXT,
    plan TEXT,
    error TEXT,
    exit_code INTEGER,
    input_tokens INTEGER,
    output_tokens INTEGER,
    cost REAL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_ranking ON tasks(status, priority DESC, created_at, id);

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    raw TEXT,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_logs_task ON task_logs(task_id, timestamp, id);
"#;

const TASK_COLUMNS: &str = "id, title, prompt, status, mode, priority, depends_on, repo_path, \
     tags, branch, working_directory, output, plan, error, exit_code, input_tokens, \
     output_tokens, cost, created_at, started_at, completed_at";

/// Pending tasks in dispatch order: priority desc, created_at asc, id asc.
/// Timestamps are fixed-width RFC3339 so the TEXT comparison is chronological.
const RANKING_ORDER: &str = "priority DESC, created_at ASC, id ASC";

fn conversion_err(msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(msg.into().into())
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> std::result::Result<Task, rusqlite::Error> {
    let status_raw: String = row.get(3)?;
    let mode_raw: String = row.get(4)?;
    let priority_rank: i64 = row.get(5)?;
    let depends_on_json: String = row.get(6)?;
    let tags_json: String = row.get(8)?;
    let created_at_raw: String = row.get(18)?;
    let started_at_raw: Option<String> = row.get(19)?;
    let completed_at_raw: Option<String> = row.get(20)?;

    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(format!("unknown status: {}", status_raw)))?;
    let mode = TaskMode::parse(&mode_raw)
        .ok_or_else(|| conversion_err(format!("unknown mode: {}", mode_raw)))?;
    let depends_on: Vec<i64> = serde_json::from_str(&depends_on_json)
        .map_err(|e| conversion_err(format!("bad depends_on: {}", e)))?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| conversion_err(format!("bad tags: {}", e)))?;

    let parse = |raw: &str| {
        parse_ts(raw).map_err(|e| conversion_err(format!("bad timestamp: {}", e)))
    };

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        status,
        mode,
        priority: TaskPriority::from_rank(priority_rank),
        depends_on,
        repo_path: row.get(7)?,
        tags,
        branch: row.get(9)?,
        working_directory: row.get(10)?,
        output: row.get(11)?,
        plan: row.get(12)?,
        error: row.get(13)?,
        exit_code: row.get(14)?,
        input_tokens: row.get(15)?,
        output_tokens: row.get(16)?,
        cost: row.get(17)?,
        created_at: parse(&created_at_raw)?,
        started_at: started_at_raw.as_deref().map(parse).transpose()?,
        completed_at: completed_at_raw.as_deref().map(parse).transpose()?,
    })
}

fn parse_log_row(row: &rusqlite::Row<'_>) -> std::result::Result<LogEntry, rusqlite::Error> {
    let severity_raw: String = row.get(3)?;
    let ts_raw: String = row.get(2)?;
    Ok(LogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        timestamp: parse_ts(&ts_raw)
            .map_err(|e| conversion_err(format!("bad timestamp: {}", e)))?,
        severity: LogSeverity::parse(&severity_raw)
            .ok_or_else(|| conversion_err(format!("unknown severity: {}", severity_raw)))?,
        message: row.get(4)?,
        raw: row.get(5)?,
    })
}

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Internal(format!("create store dir: {}", e)))?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| Error::Internal(format!("open database: {}", e)))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| Error::Internal(format!("run schema: {}", e)))?;
            Ok::<_, Error>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn get_task_sync(conn: &Connection, id: i64) -> Result<Option<Task>> {
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                parse_task_row,
            )
            .optional()?;
        Ok(task)
    }

    fn task_exists(conn: &Connection, id: i64) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_task(conn: &Connection, new: &NewTask) -> Result<Task> {
        validate_new_task(new)?;
        for dep in &new.depends_on {
            if !Self::task_exists(conn, *dep)? {
                return Err(Error::Validation(format!(
                    "depends_on references unknown task {}",
                    dep
                )));
            }
        }

        let depends_on = serde_json::to_string(&new.depends_on).map_err(Error::internal)?;
        let tags = serde_json::to_string(&new.tags).map_err(Error::internal)?;
        conn.execute(
            "INSERT INTO tasks (title, prompt, status, mode, priority, depends_on, repo_path, tags, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.title,
                new.prompt,
                TaskStatus::Pending.as_str(),
                new.mode.as_str(),
                new.priority.rank(),
                depends_on,
                new.repo_path,
                tags,
                format_ts(Utc::now()),
            ],
        )?;

        let id = conn.last_insert_rowid();
        Self::get_task_sync(conn, id)?
            .ok_or_else(|| Error::Internal("task vanished after insert".to_string()))
    }

    fn write_task(conn: &Connection, task: &Task) -> Result<()> {
        let depends_on = serde_json::to_string(&task.depends_on).map_err(Error::internal)?;
        let tags = serde_json::to_string(&task.tags).map_err(Error::internal)?;
        conn.execute(
            "UPDATE tasks SET title = ?1, prompt = ?2, status = ?3, mode = ?4, priority = ?5, \
             depends_on = ?6, repo_path = ?7, tags = ?8, branch = ?9, working_directory = ?10, \
             output = ?11, plan = ?12, error = ?13, exit_code = ?14, input_tokens = ?15, \
             output_tokens = ?16, cost = ?17, started_at = ?18, completed_at = ?19 \
             WHERE id = ?20",
            params![
                task.title,
                task.prompt,
                task.status.as_str(),
                task.mode.as_str(),
                task.priority.rank(),
                depends_on,
                task.repo_path,
                tags,
                task.branch,
                task.working_directory,
                task.output,
                task.plan,
                task.error,
                task.exit_code,
                task.input_tokens,
                task.output_tokens,
                task.cost,
                task.started_at.map(format_ts),
                task.completed_at.map(format_ts),
                task.id,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let conn = self.conn.lock().await;
        Self::insert_task(&conn, &new)
    }

    async fn create_tasks_batch(&self, batch: Vec<NewTask>) -> Result<Vec<Task>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut created = Vec::with_capacity(batch.len());
        for new in &batch {
            created.push(Self::insert_task(&tx, new)?);
        }
        tx.commit()?;
        Ok(created)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        Self::get_task_sync(&conn, id)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let (sql, filter) = match status {
            Some(TaskStatus::Pending) => (
                format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY {}",
                    TASK_COLUMNS, RANKING_ORDER
                ),
                Some(TaskStatus::Pending),
            ),
            Some(s) => (
                format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                    TASK_COLUMNS
                ),
                Some(s),
            ),
            None => (
                format!(
                    "SELECT {} FROM tasks ORDER BY created_at ASC, id ASC",
                    TASK_COLUMNS
                ),
                None,
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match filter {
            Some(s) => stmt.query_map(params![s.as_str()], parse_task_row)?,
            None => stmt.query_map([], parse_task_row)?,
        };
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task> {
        let conn = self.conn.lock().await;
        let mut task = Self::get_task_sync(&conn, id)?.ok_or(Error::NotFound(id))?;
        apply_patch(&mut task, patch)?;
        Self::write_task(&conn, &task)?;
        Ok(task)
    }

    async fn count_tasks(&self, status: TaskStatus) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn get_next_pending_task(&self) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY {} LIMIT 1",
                    TASK_COLUMNS, RANKING_ORDER
                ),
                params![TaskStatus::Pending.as_str()],
                parse_task_row,
            )
            .optional()?;
        Ok(task)
    }

    async fn add_log(
        &self,
        task_id: i64,
        severity: LogSeverity,
        message: &str,
        raw: Option<&str>,
    ) -> Result<LogEntry> {
        let conn = self.conn.lock().await;
        if !Self::task_exists(&conn, task_id)? {
            return Err(Error::NotFound(task_id));
        }
        let timestamp = Utc::now();
        conn.execute(
            "INSERT INTO task_logs (task_id, timestamp, severity, message, raw) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, format_ts(timestamp), severity.as_str(), message, raw],
        )?;
        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            task_id,
            timestamp,
            severity,
            message: message.to_string(),
            raw: raw.map(|s| s.to_string()),
        })
    }

    async fn get_task_logs(&self, task_id: i64) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, timestamp, severity, message, raw FROM task_logs \
             WHERE task_id = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], parse_log_row)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        // The schema declares ON DELETE CASCADE but foreign_keys is a
        // per-connection pragma, so delete logs explicitly as well.
        conn.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id])?;
        let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let repaired = conn.execute(
            "UPDATE tasks SET status = ?1, started_at = NULL WHERE status = ?2",
            params![
                TaskStatus::Pending.as_str(),
                TaskStatus::InProgress.as_str()
            ],
        )?;
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            prompt: "do something".to_string(),
            mode: TaskMode::Execute,
            priority: TaskPriority::Medium,
            depends_on: vec![],
            repo_path: None,
            tags: vec![],
        }
    }

    async fn open_store(dir: &TempDir) -> SqliteTaskStore {
        SqliteTaskStore::new(dir.path().join("tasks.db"))
            .await
            .expect("failed to open store")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let task = store.create_task(new_task("first")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "first");

        assert!(store.get_task(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let a = store.create_task(new_task("a")).await.unwrap();
        let b = store.create_task(new_task("b")).await.unwrap();
        let c = store.create_task(new_task("c")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn test_depends_on_must_exist() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut bad = new_task("dependent");
        bad.depends_on = vec![42];
        let err = store.create_task(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // An existing but incomplete dependency is fine.
        let dep = store.create_task(new_task("dep")).await.unwrap();
        let mut good = new_task("dependent");
        good.depends_on = vec![dep.id];
        let task = store.create_task(good).await.unwrap();
        assert_eq!(task.depends_on, vec![dep.id]);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut bad = new_task("second");
        bad.depends_on = vec![777];
        let err = store
            .create_tasks_batch(vec![new_task("first"), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_tasks(None).await.unwrap().is_empty());

        let created = store
            .create_tasks_batch(vec![new_task("one"), new_task("two")])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
    }

    #[tokio::test]
    async fn test_ranking_priority_then_age_then_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut low = new_task("low");
        low.priority = TaskPriority::Low;
        let mut urgent = new_task("urgent");
        urgent.priority = TaskPriority::Urgent;
        let mut medium = new_task("medium");
        medium.priority = TaskPriority::Medium;

        let low = store.create_task(low).await.unwrap();
        let urgent = store.create_task(urgent).await.unwrap();
        let medium = store.create_task(medium).await.unwrap();

        let next = store.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.id, urgent.id);

        let ranked = store.list_tasks(Some(TaskStatus::Pending)).await.unwrap();
        let ids: Vec<i64> = ranked.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![urgent.id, medium.id, low.id]);
    }

    #[tokio::test]
    async fn test_ranking_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for i in 0..5 {
            store.create_task(new_task(&format!("t{}", i))).await.unwrap();
        }
        let first = store.get_next_pending_task().await.unwrap().unwrap();
        for _ in 0..3 {
            let again = store.get_next_pending_task().await.unwrap().unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[tokio::test]
    async fn test_update_rejects_bad_transition() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let task = store.create_task(new_task("t")).await.unwrap();
        let err = store
            .update_task(task.id, TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));

        let err = store
            .update_task(9999, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_ordered_and_cascade_deleted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let task = store.create_task(new_task("t")).await.unwrap();
        store
            .add_log(task.id, LogSeverity::Info, "one", None)
            .await
            .unwrap();
        store
            .add_log(task.id, LogSeverity::Warn, "two", Some("{\"raw\":true}"))
            .await
            .unwrap();
        store
            .add_log(task.id, LogSeverity::Error, "three", None)
            .await
            .unwrap();

        let logs = store.get_task_logs(task.id).await.unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert_eq!(logs[1].raw.as_deref(), Some("{\"raw\":true}"));

        store.delete_task(task.id).await.unwrap();
        assert!(store.get_task(task.id).await.unwrap().is_none());
        assert!(store.get_task_logs(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_log_unknown_task() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let err = store
            .add_log(123, LogSeverity::Info, "orphan", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recover_repairs_in_progress() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let a = store.create_task(new_task("a")).await.unwrap();
        let b = store.create_task(new_task("b")).await.unwrap();
        let c = store.create_task(new_task("c")).await.unwrap();
        store
            .update_task(a.id, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .update_task(b.id, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();

        let repaired = store.recover().await.unwrap();
        assert_eq!(repaired, 2);

        for id in [a.id, b.id, c.id] {
            let task = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert!(task.started_at.is_none());
        }
        assert_eq!(store.count_tasks(TaskStatus::InProgress).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open_store(&dir).await;
            store.create_task(new_task("durable")).await.unwrap().id
        };
        let store = open_store(&dir).await;
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.title, "durable");
    }
}
