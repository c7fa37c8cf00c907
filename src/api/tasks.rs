//! Task command handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{http_error, AppState};
use crate::error::Error;
use crate::hub::TaskEvent;
use crate::store::{LogEntry, NewTask, Task, TaskMode, TaskPatch, TaskStatus};

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.store.create_task(new).await.map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn create_tasks_batch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<Vec<NewTask>>,
) -> ApiResult<(StatusCode, Json<Vec<Task>>)> {
    let tasks = state
        .store
        .create_tasks_batch(batch)
        .await
        .map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(tasks)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            http_error(Error::Validation(format!("unknown status: {}", raw)))
        })?),
        None => None,
    };
    let tasks = state.store.list_tasks(status).await.map_err(http_error)?;
    Ok(Json(tasks))
}

#[derive(Debug, Serialize)]
pub struct TaskWithLogs {
    #[serde(flatten)]
    pub task: Task,
    pub logs: Vec<LogEntry>,
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TaskWithLogs>> {
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(Error::NotFound(id)))?;
    let logs = state.store.get_task_logs(id).await.map_err(http_error)?;
    Ok(Json(TaskWithLogs { task, logs }))
}

pub async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    state
        .store
        .get_task(id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(Error::NotFound(id)))?;
    let logs = state.store.get_task_logs(id).await.map_err(http_error)?;
    Ok(Json(logs))
}

/// Cancel a task. A pending task is cancelled in the store directly; a
/// running task has its agent process signalled and the executor records
/// the terminal state once the event stream drains.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(Error::NotFound(id)))?;

    match task.status {
        TaskStatus::Pending => {
            let updated = state
                .store
                .update_task(id, TaskPatch::status(TaskStatus::Cancelled))
                .await
                .map_err(http_error)?;
            state
                .hub
                .broadcast(TaskEvent::state(id, TaskStatus::Cancelled))
                .await;
            Ok(Json(updated))
        }
        TaskStatus::InProgress => {
            if state.executor.cancel(id).await {
                // The executor owns the terminal update from here.
                Ok(Json(task))
            } else {
                // No live process registered; record the cancellation directly.
                let updated = state
                    .store
                    .update_task(id, TaskPatch::status(TaskStatus::Cancelled))
                    .await
                    .map_err(http_error)?;
                state
                    .hub
                    .broadcast(TaskEvent::state(id, TaskStatus::Cancelled))
                    .await;
                Ok(Json(updated))
            }
        }
        status => Err(http_error(Error::StateConflict {
            from: status,
            to: TaskStatus::Cancelled,
        })),
    }
}

/// Retry a failed task: back to pending with error, exit code, token usage
/// and cost cleared. Retrying twice has the same effect as once.
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(Error::NotFound(id)))?;
    if !matches!(task.status, TaskStatus::Failed | TaskStatus::Pending) {
        return Err(http_error(Error::StateConflict {
            from: task.status,
            to: TaskStatus::Pending,
        }));
    }

    let was_failed = task.status == TaskStatus::Failed;
    let updated = state
        .store
        .update_task(id, TaskPatch::status(TaskStatus::Pending))
        .await
        .map_err(http_error)?;
    if was_failed {
        state
            .hub
            .broadcast(TaskEvent::state(id, TaskStatus::Pending))
            .await;
    }
    Ok(Json(updated))
}

/// Approve a plan under review: the task re-enters the queue in execute
/// mode so the agent implements what it planned.
pub async fn approve_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(Error::NotFound(id)))?;
    if !matches!(task.status, TaskStatus::Review | TaskStatus::Pending) {
        return Err(http_error(Error::StateConflict {
            from: task.status,
            to: TaskStatus::Pending,
        }));
    }

    let was_review = task.status == TaskStatus::Review;
    let patch = TaskPatch {
        status: Some(TaskStatus::Pending),
        mode: Some(TaskMode::Execute),
        ..Default::default()
    };
    let updated = state.store.update_task(id, patch).await.map_err(http_error)?;
    if was_review {
        state
            .hub
            .broadcast(TaskEvent::state(id, TaskStatus::Pending))
            .await;
    }
    Ok(Json(updated))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.store.delete_task(id).await.map_err(http_error)?;
    Ok(Json(json!({ "ok": true })))
}
