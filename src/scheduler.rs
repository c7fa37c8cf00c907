//! Scheduler: continuously advances pending work into running work.
//!
//! A single actor loop owns all task-store writes that follow from
//! execution: dispatch transitions, per-event log appends, and terminal
//! updates all pass through here in FIFO order, which yields the per-task
//! ordering guarantee (log order = emission order = broadcast order, with
//! the terminal update last).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorMessage, TaskExecutor, TaskResult};
use crate::hub::{EventHub, TaskEvent};
use crate::store::{LogSeverity, Task, TaskPatch, TaskStatus, TaskStore};

enum DepCheck {
    /// All dependencies completed.
    Ready,
    /// Some dependency exists but has not completed yet.
    Waiting,
    /// A referenced task does not exist; the task can never run.
    Missing(i64),
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    hub: Arc<EventHub>,
    executor: Arc<TaskExecutor>,
    max_concurrent: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<EventHub>,
        executor: Arc<TaskExecutor>,
        max_concurrent: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            executor,
            max_concurrent,
            poll_interval,
        }
    }

    /// Spawn the scheduler loop as an independent activity.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let (sink, mut results) = mpsc::channel::<ExecutorMessage>(1024);
        let mut warned_missing_dep: HashSet<i64> = HashSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            max_concurrent = self.max_concurrent,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopping");
                    break;
                }
                Some(msg) = results.recv() => {
                    let completed = matches!(msg, ExecutorMessage::Complete { .. });
                    self.handle_message(msg).await;
                    if completed {
                        // A slot freed up (and a dependency may have been
                        // satisfied); dispatch without waiting for the tick.
                        self.tick(&sink, &mut warned_missing_dep).await;
                    }
                }
                _ = interval.tick() => {
                    self.tick(&sink, &mut warned_missing_dep).await;
                }
            }
        }
    }

    /// One scheduling pass: dispatch as many runnable tasks as there are
    /// free slots, in ranking order.
    async fn tick(&self, sink: &mpsc::Sender<ExecutorMessage>, warned: &mut HashSet<i64>) {
        let running = match self.store.count_tasks(TaskStatus::InProgress).await {
            Ok(n) => n,
            Err(e) => {
                error!("scheduler failed to count running tasks: {}", e);
                return;
            }
        };
        let mut free = self.max_concurrent.saturating_sub(running);
        if free == 0 {
            return;
        }

        let pending = match self.store.list_tasks(Some(TaskStatus::Pending)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("scheduler failed to list pending tasks: {}", e);
                return;
            }
        };

        for task in pending {
            if free == 0 {
                break;
            }
            match self.dependencies_met(&task).await {
                Ok(DepCheck::Ready) => {
                    if self.dispatch(task, sink).await {
                        free -= 1;
                    }
                }
                Ok(DepCheck::Waiting) => {
                    debug!(task_id = task.id, "dependencies not yet completed");
                }
                Ok(DepCheck::Missing(dep)) => {
                    if warned.insert(task.id) {
                        warn!(task_id = task.id, dep, "dependency does not exist");
                        let _ = self
                            .store
                            .add_log(
                                task.id,
                                LogSeverity::Warn,
                                &format!("dependency {} does not exist; task cannot run", dep),
                                None,
                            )
                            .await;
                    }
                }
                Err(e) => {
                    error!(task_id = task.id, "dependency check failed: {}", e);
                }
            }
        }
    }

    async fn dependencies_met(&self, task: &Task) -> crate::error::Result<DepCheck> {
        for dep in &task.depends_on {
            match self.store.get_task(*dep).await? {
                None => return Ok(DepCheck::Missing(*dep)),
                Some(t) if t.status != TaskStatus::Completed => return Ok(DepCheck::Waiting),
                Some(_) => {}
            }
        }
        Ok(DepCheck::Ready)
    }

    /// Atomically move a task to IN_PROGRESS and start its executor
    /// activity. Returns whether the dispatch happened.
    async fn dispatch(&self, task: Task, sink: &mpsc::Sender<ExecutorMessage>) -> bool {
        let updated = match self
            .store
            .update_task(task.id, TaskPatch::status(TaskStatus::InProgress))
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(task_id = task.id, "dispatch transition rejected: {}", e);
                return false;
            }
        };

        info!(task_id = task.id, title = %updated.title, "dispatching task");
        self.hub
            .broadcast(TaskEvent::state(task.id, TaskStatus::InProgress))
            .await;

        let executor = Arc::clone(&self.executor);
        let sink = sink.clone();
        tokio::spawn(async move {
            executor.run_task(updated, sink).await;
        });
        true
    }

    async fn handle_message(&self, msg: ExecutorMessage) {
        match msg {
            ExecutorMessage::Workspace {
                task_id,
                branch,
                working_directory,
            } => {
                let patch = TaskPatch {
                    branch: Some(branch),
                    working_directory: Some(working_directory),
                    ..Default::default()
                };
                if let Err(e) = self.store.update_task(task_id, patch).await {
                    warn!(task_id, "failed to record workspace: {}", e);
                }
            }
            ExecutorMessage::Output {
                task_id,
                event,
                raw,
            } => {
                let severity = event.severity();
                let message = event.summary();
                if let Err(e) = self
                    .store
                    .add_log(task_id, severity, &message, Some(&raw))
                    .await
                {
                    warn!(task_id, "failed to append task log: {}", e);
                }
                self.hub
                    .broadcast(TaskEvent::output(task_id, severity, message, Some(raw)))
                    .await;
            }
            ExecutorMessage::Warning { task_id, message } => {
                if let Err(e) = self
                    .store
                    .add_log(task_id, LogSeverity::Warn, &message, None)
                    .await
                {
                    warn!(task_id, "failed to append warning log: {}", e);
                }
                self.hub
                    .broadcast(TaskEvent::output(
                        task_id,
                        LogSeverity::Warn,
                        message,
                        None,
                    ))
                    .await;
            }
            ExecutorMessage::Complete { task_id, result } => {
                self.finish_task(task_id, result).await;
            }
        }
    }

    async fn finish_task(&self, task_id: i64, result: TaskResult) {
        let patch = TaskPatch {
            status: Some(result.status),
            output: result.output.clone(),
            plan: result.plan.clone(),
            error: result.error.clone(),
            exit_code: result.exit_code,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            cost: result.cost,
            ..Default::default()
        };
        if let Err(e) = self.store.update_task(task_id, patch).await {
            error!(task_id, "failed to persist terminal state: {}", e);
        }

        let (severity, message) = match result.status {
            TaskStatus::Completed => (LogSeverity::Info, "task completed".to_string()),
            TaskStatus::Cancelled => (LogSeverity::Info, "task cancelled".to_string()),
            _ => (
                LogSeverity::Error,
                format!(
                    "task failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        if let Err(e) = self.store.add_log(task_id, severity, &message, None).await {
            warn!(task_id, "failed to append completion log: {}", e);
        }

        info!(task_id, status = %result.status, "task finished");
        self.hub
            .broadcast(TaskEvent::complete(
                task_id,
                result.status,
                result.exit_code,
                result.input_tokens,
                result.output_tokens,
                result.cost,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentLauncher;
    use crate::hub::TaskEventKind;
    use crate::store::{InMemoryTaskStore, NewTask, TaskMode, TaskPriority};
    use crate::workspace::WorkspaceManager;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    const HAPPY_STUB: &str = "#!/bin/sh\n\
        echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\n\
        echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"hi\",\"usage\":{\"input_tokens\":10,\"output_tokens\":5},\"total_cost_usd\":0.01}'\n";

    const SLOW_STUB: &str = "#!/bin/sh\n\
        sleep 0.4\n\
        echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\"}'\n";

    const LOOP_STUB: &str = "#!/bin/sh\n\
        while true; do\n\
        echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"tick\"}]}}'\n\
        sleep 0.05\n\
        done\n";

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn TaskStore>,
        hub: Arc<EventHub>,
        executor: Arc<TaskExecutor>,
        shutdown: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn create_temp_repo(dir: &TempDir) -> PathBuf {
        let repo = dir.path().join("project");
        std::fs::create_dir_all(&repo).unwrap();
        let run = |args: &[&str]| {
            let out = StdCommand::new("git")
                .args(args)
                .current_dir(&repo)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {:?} failed", args);
        };
        run(&["init"]);
        run(&["config", "user.email", "test@taskpilot.dev"]);
        run(&["config", "user.name", "Taskpilot Test"]);
        std::fs::write(repo.join("README.md"), "# repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        repo
    }

    fn start_scheduler(stub_script: &str, max_concurrent: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = create_temp_repo(&dir);
        let stub = dir.path().join("stub-agent.sh");
        std::fs::write(&stub, stub_script).unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let hub = Arc::new(EventHub::new());
        let executor = Arc::new(TaskExecutor::new(
            AgentLauncher::new(stub.to_string_lossy().to_string()),
            WorkspaceManager::new(repo, Some(dir.path().join("worktrees"))),
            dir.path().join("task-logs"),
        ));

        let shutdown = CancellationToken::new();
        Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&executor),
            max_concurrent,
            Duration::from_millis(50),
        )
        .spawn(shutdown.clone());

        Fixture {
            _dir: dir,
            store,
            hub,
            executor,
            shutdown,
        }
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            prompt: "do it".to_string(),
            mode: TaskMode::Execute,
            priority: TaskPriority::Medium,
            depends_on: vec![],
            repo_path: None,
            tags: vec![],
        }
    }

    async fn wait_for_status(
        store: &Arc<dyn TaskStore>,
        id: i64,
        status: TaskStatus,
        timeout: Duration,
    ) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} stuck in {:?} waiting for {:?}",
                id,
                task.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_happy_path_end_to_end() {
        let fx = start_scheduler(HAPPY_STUB, 3);
        let (_, mut observer) = fx.hub.attach().await;

        let task = fx.store.create_task(new_task("t")).await.unwrap();
        let done = wait_for_status(&fx.store, task.id, TaskStatus::Completed, Duration::from_secs(3)).await;

        assert!(done.output.as_deref().unwrap().contains("hi"));
        assert_eq!(done.input_tokens, Some(10));
        assert_eq!(done.output_tokens, Some(5));
        assert_eq!(done.cost, Some(0.01));
        assert_eq!(done.exit_code, Some(0));
        assert!(done.branch.as_deref().unwrap().starts_with("task-"));
        assert!(done.completed_at.is_some());
        assert!(done.started_at.unwrap() >= done.created_at);
        assert!(done.completed_at.unwrap() >= done.started_at.unwrap());

        // Observer saw the dispatch, at least one output, and the terminal
        // summary, in that order.
        let mut saw_state = false;
        let mut outputs = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), observer.recv())
                .await
                .expect("observer starved")
                .expect("hub closed");
            assert_eq!(event.task_id, task.id);
            match event.kind {
                TaskEventKind::State { status } => {
                    assert_eq!(status, TaskStatus::InProgress);
                    saw_state = true;
                }
                TaskEventKind::Output { .. } => outputs += 1,
                TaskEventKind::Complete {
                    status,
                    exit_code,
                    input_tokens,
                    output_tokens,
                    cost,
                } => {
                    assert_eq!(status, TaskStatus::Completed);
                    assert_eq!(exit_code, Some(0));
                    assert_eq!(input_tokens, Some(10));
                    assert_eq!(output_tokens, Some(5));
                    assert_eq!(cost, Some(0.01));
                    break;
                }
            }
        }
        assert!(saw_state, "missing state event");
        assert!(outputs >= 1, "missing output events");

        // Log entries persisted for everything the observer saw.
        let logs = fx.store.get_task_logs(task.id).await.unwrap();
        assert!(logs.len() >= outputs);
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let fx = start_scheduler(SLOW_STUB, 5);

        let a = fx.store.create_task(new_task("a")).await.unwrap();
        let mut nb = new_task("b");
        nb.depends_on = vec![a.id];
        let b = fx.store.create_task(nb).await.unwrap();

        // While A runs, B must stay pending despite free slots.
        wait_for_status(&fx.store, a.id, TaskStatus::InProgress, Duration::from_secs(2)).await;
        let b_now = fx.store.get_task(b.id).await.unwrap().unwrap();
        assert_eq!(b_now.status, TaskStatus::Pending);

        let a_done =
            wait_for_status(&fx.store, a.id, TaskStatus::Completed, Duration::from_secs(3)).await;
        let b_done =
            wait_for_status(&fx.store, b.id, TaskStatus::Completed, Duration::from_secs(3)).await;
        assert!(b_done.started_at.unwrap() >= a_done.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let fx = start_scheduler(SLOW_STUB, 3);

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(fx.store.create_task(new_task(&format!("t{}", i))).await.unwrap().id);
        }

        // Steady state: exactly 3 running, 2 still pending.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            fx.store.count_tasks(TaskStatus::InProgress).await.unwrap(),
            3
        );
        assert_eq!(fx.store.count_tasks(TaskStatus::Pending).await.unwrap(), 2);

        for id in &ids {
            wait_for_status(&fx.store, *id, TaskStatus::Completed, Duration::from_secs(5)).await;
        }
    }

    #[tokio::test]
    async fn test_zero_concurrency_never_dispatches() {
        let fx = start_scheduler(HAPPY_STUB, 0);
        let task = fx.store.create_task(new_task("t")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let task = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_run() {
        let fx = start_scheduler(LOOP_STUB, 3);

        let task = fx.store.create_task(new_task("loopy")).await.unwrap();
        wait_for_status(&fx.store, task.id, TaskStatus::InProgress, Duration::from_secs(2)).await;

        // Give the stub a moment to emit something, then cancel.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.executor.cancel(task.id).await);

        let done =
            wait_for_status(&fx.store, task.id, TaskStatus::Cancelled, Duration::from_secs(3)).await;
        assert!(done.completed_at.is_some());
        let wd = done.working_directory.expect("workspace was assigned");
        assert!(
            !std::path::Path::new(&wd).exists(),
            "cancelled workspace should be removed"
        );
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        // One slot: the urgent task must run before the older medium one
        // whenever both are pending at dispatch time.
        let fx = start_scheduler(SLOW_STUB, 1);

        let blocker = fx.store.create_task(new_task("blocker")).await.unwrap();
        wait_for_status(&fx.store, blocker.id, TaskStatus::InProgress, Duration::from_secs(2)).await;

        let medium = fx.store.create_task(new_task("medium")).await.unwrap();
        let mut urgent_new = new_task("urgent");
        urgent_new.priority = TaskPriority::Urgent;
        let urgent = fx.store.create_task(urgent_new).await.unwrap();

        let urgent_done =
            wait_for_status(&fx.store, urgent.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        let medium_done =
            wait_for_status(&fx.store, medium.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        assert!(urgent_done.started_at.unwrap() <= medium_done.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_missing_dependency_blocks_and_warns_once() {
        // One slot, held by a long-running blocker so the dependency can be
        // deleted while it is still pending.
        let fx = start_scheduler(SLOW_STUB, 1);

        let blocker = fx.store.create_task(new_task("blocker")).await.unwrap();
        wait_for_status(&fx.store, blocker.id, TaskStatus::InProgress, Duration::from_secs(2)).await;

        let a = fx.store.create_task(new_task("a")).await.unwrap();
        let mut nb = new_task("b");
        nb.depends_on = vec![a.id];
        let b = fx.store.create_task(nb).await.unwrap();
        // Delete the dependency out from under B before anything dispatches.
        fx.store.delete_task(a.id).await.unwrap();

        wait_for_status(&fx.store, blocker.id, TaskStatus::Completed, Duration::from_secs(3)).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let b_now = fx.store.get_task(b.id).await.unwrap().unwrap();
        assert_eq!(b_now.status, TaskStatus::Pending);

        let warnings: Vec<_> = fx
            .store
            .get_task_logs(b.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.severity == LogSeverity::Warn)
            .collect();
        assert_eq!(warnings.len(), 1, "missing dependency is warned exactly once");
    }
}
