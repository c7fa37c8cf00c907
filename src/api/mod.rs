//! HTTP API for taskpilot.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/tasks` - Create a task
//! - `POST /api/tasks/batch` - Create several tasks atomically
//! - `GET /api/tasks` - List tasks (optional `?status=` filter)
//! - `GET /api/tasks/{id}` - Task with its ordered logs
//! - `GET /api/tasks/{id}/logs` - Ordered logs only
//! - `POST /api/tasks/{id}/cancel` - Cancel a pending or running task
//! - `POST /api/tasks/{id}/retry` - Retry a failed task
//! - `POST /api/tasks/{id}/approve` - Approve a plan awaiting review
//! - `DELETE /api/tasks/{id}` - Delete a task and its logs
//! - `GET /api/events` - Live task event stream via SSE
//!
//! Mutating endpoints require a matching `x-api-key` header when
//! `API_CREDENTIAL` is configured.

mod auth;
mod stream;
mod tasks;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::AgentLauncher;
use crate::config::Config;
use crate::error::Error;
use crate::executor::TaskExecutor;
use crate::hub::EventHub;
use crate::scheduler::Scheduler;
use crate::store::{SqliteTaskStore, TaskStore};
use crate::workspace::WorkspaceManager;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn TaskStore>,
    pub hub: Arc<EventHub>,
    pub executor: Arc<TaskExecutor>,
}

/// Map a core error onto the HTTP surface.
pub(crate) fn http_error(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::StateConflict { .. } => StatusCode::CONFLICT,
        Error::Workspace(_) | Error::Executor(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Build the API router for the given state.
///
/// The credential guard wraps the whole API; it only enforces on mutating
/// methods, so reads and the event stream stay open.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(tasks::health))
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/batch", post(tasks::create_tasks_batch))
        .route(
            "/tasks/:id",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/tasks/:id/logs", get(tasks::get_task_logs))
        .route("/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/tasks/:id/retry", post(tasks::retry_task))
        .route("/tasks/:id/approve", post(tasks::approve_plan))
        .route("/events", get(stream::observe))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_credential,
        ));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Boot the execution plane and serve the API until shutdown.
///
/// Boot order matters: recovery runs against the freshly opened store
/// before the scheduler starts, so no task is ever IN_PROGRESS when
/// dispatching begins.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(config.db_path.clone()).await?);

    let repaired = store.recover().await?;
    if repaired > 0 {
        info!(repaired, "recovered interrupted tasks back to pending");
    }

    let hub = Arc::new(EventHub::new());
    let workspaces = WorkspaceManager::new(config.base_repo.clone(), None);
    // A crash may have left worktree registrations behind for directories
    // that no longer exist.
    if let Err(e) = workspaces.prune_workspaces().await {
        warn!("boot workspace prune failed: {}", e);
    }
    let executor = Arc::new(TaskExecutor::new(
        AgentLauncher::new(config.agent_cli.clone()),
        workspaces,
        config.log_dir.clone(),
    ));

    let shutdown = CancellationToken::new();
    Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&executor),
        config.max_concurrent,
        config.poll_interval,
    )
    .spawn(shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        config,
        store,
        hub,
        executor,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, router(state)).await?;

    shutdown.cancel();
    Ok(())
}
