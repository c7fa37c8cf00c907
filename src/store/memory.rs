//! In-memory task store (non-persistent, for testing).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    apply_patch, ranking_key, validate_new_task, LogEntry, LogSeverity, NewTask, Task, TaskPatch,
    TaskStatus, TaskStore,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<i64, Task>,
    logs: BTreeMap<i64, Vec<LogEntry>>,
    next_task_id: i64,
    next_log_id: i64,
}

impl Inner {
    fn insert_task(&mut self, new: &NewTask) -> Result<Task> {
        validate_new_task(new)?;
        for dep in &new.depends_on {
            if !self.tasks.contains_key(dep) {
                return Err(Error::Validation(format!(
                    "depends_on references unknown task {}",
                    dep
                )));
            }
        }

        self.next_task_id += 1;
        let task = Task {
            id: self.next_task_id,
            title: new.title.clone(),
            prompt: new.prompt.clone(),
            status: TaskStatus::Pending,
            mode: new.mode,
            priority: new.priority,
            depends_on: new.depends_on.clone(),
            repo_path: new.repo_path.clone(),
            tags: new.tags.clone(),
            branch: None,
            working_directory: None,
            output: None,
            plan: None,
            error: None,
            exit_code: None,
            input_tokens: None,
            output_tokens: None,
            cost: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut inner = self.inner.write().await;
        inner.insert_task(&new)
    }

    async fn create_tasks_batch(&self, batch: Vec<NewTask>) -> Result<Vec<Task>> {
        let mut inner = self.inner.write().await;
        // Validate against a scratch copy so a failure leaves no partial state.
        let snapshot_tasks = inner.tasks.clone();
        let snapshot_next = inner.next_task_id;
        let mut created = Vec::with_capacity(batch.len());
        for new in &batch {
            match inner.insert_task(new) {
                Ok(task) => created.push(task),
                Err(e) => {
                    inner.tasks = snapshot_tasks;
                    inner.next_task_id = snapshot_next;
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        if status == Some(TaskStatus::Pending) {
            tasks.sort_by_key(ranking_key);
        } else {
            tasks.sort_by_key(|t| (t.created_at, t.id));
        }
        Ok(tasks)
    }

    async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(Error::NotFound(id))?;
        apply_patch(task, patch)?;
        Ok(task.clone())
    }

    async fn count_tasks(&self, status: TaskStatus) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.values().filter(|t| t.status == status).count())
    }

    async fn get_next_pending_task(&self) -> Result<Option<Task>> {
        Ok(self
            .list_tasks(Some(TaskStatus::Pending))
            .await?
            .into_iter()
            .next())
    }

    async fn add_log(
        &self,
        task_id: i64,
        severity: LogSeverity,
        message: &str,
        raw: Option<&str>,
    ) -> Result<LogEntry> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&task_id) {
            return Err(Error::NotFound(task_id));
        }
        inner.next_log_id += 1;
        let entry = LogEntry {
            id: inner.next_log_id,
            task_id,
            timestamp: Utc::now(),
            severity,
            message: message.to_string(),
            raw: raw.map(|s| s.to_string()),
        };
        inner.logs.entry(task_id).or_default().push(entry.clone());
        Ok(entry)
    }

    async fn get_task_logs(&self, task_id: i64) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.logs.get(&task_id).cloned().unwrap_or_default())
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.remove(&id).is_none() {
            return Err(Error::NotFound(id));
        }
        inner.logs.remove(&id);
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut repaired = 0;
        for task in inner.tasks.values_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TaskMode, TaskPriority};

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            prompt: "p".to_string(),
            mode: TaskMode::Execute,
            priority: TaskPriority::Medium,
            depends_on: vec![],
            repo_path: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_created_pending_and_listed_in_creation_order() {
        let store = InMemoryTaskStore::new();
        let a = store.create_task(new_task("a")).await.unwrap();
        let b = store.create_task(new_task("b")).await.unwrap();
        assert_eq!(a.status, TaskStatus::Pending);

        let all = store.list_tasks(None).await.unwrap();
        assert_eq!(
            all.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_failure() {
        let store = InMemoryTaskStore::new();
        let mut bad = new_task("bad");
        bad.depends_on = vec![99];
        let err = store
            .create_tasks_batch(vec![new_task("ok"), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_urgent_ranks_first() {
        let store = InMemoryTaskStore::new();
        store.create_task(new_task("medium")).await.unwrap();
        let mut urgent = new_task("urgent");
        urgent.priority = TaskPriority::Urgent;
        let urgent = store.create_task(urgent).await.unwrap();

        let next = store.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.id, urgent.id);
    }

    #[tokio::test]
    async fn test_recover() {
        let store = InMemoryTaskStore::new();
        let a = store.create_task(new_task("a")).await.unwrap();
        store
            .update_task(a.id, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        let a = store.get_task(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.started_at.is_none());
    }
}
