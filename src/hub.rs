//! Task event fan-out to streaming observers.
//!
//! Observers attach with a bounded queue each. Broadcast iterates a snapshot
//! of the observer set so concurrent attach/detach never invalidates the
//! iteration, and a failing observer is detached instead of aborting the
//! broadcast. The core never blocks on a slow observer.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::store::{LogSeverity, TaskStatus};

/// Per-observer queue depth. An observer that falls this far behind is
/// dropped rather than allowed to stall task execution.
const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Observer-visible event. Every payload carries the task id; no cross-task
/// ordering is promised.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: i64,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// A parsed agent event, mirrored from the task log.
    Output {
        severity: LogSeverity,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    /// A status transition.
    State { status: TaskStatus },
    /// Terminal summary, broadcast after all preceding output events.
    Complete {
        status: TaskStatus,
        exit_code: Option<i32>,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        cost: Option<f64>,
    },
}

impl TaskEventKind {
    /// SSE event name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            TaskEventKind::Output { .. } => "output",
            TaskEventKind::State { .. } => "state",
            TaskEventKind::Complete { .. } => "complete",
        }
    }
}

impl TaskEvent {
    pub fn output(
        task_id: i64,
        severity: LogSeverity,
        message: impl Into<String>,
        raw: Option<String>,
    ) -> Self {
        Self {
            task_id,
            kind: TaskEventKind::Output {
                severity,
                message: message.into(),
                raw,
            },
        }
    }

    pub fn state(task_id: i64, status: TaskStatus) -> Self {
        Self {
            task_id,
            kind: TaskEventKind::State { status },
        }
    }

    pub fn complete(
        task_id: i64,
        status: TaskStatus,
        exit_code: Option<i32>,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        cost: Option<f64>,
    ) -> Self {
        Self {
            task_id,
            kind: TaskEventKind::Complete {
                status,
                exit_code,
                input_tokens,
                output_tokens,
                cost,
            },
        }
    }
}

#[derive(Default)]
pub struct EventHub {
    observers: RwLock<HashMap<Uuid, mpsc::Sender<TaskEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; returns its id and the event receiver.
    pub async fn attach(&self) -> (Uuid, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.observers.write().await.insert(id, tx);
        debug!(observer = %id, "observer attached");
        (id, rx)
    }

    /// Remove an observer if present. Idempotent.
    pub async fn detach(&self, id: Uuid) {
        if self.observers.write().await.remove(&id).is_some() {
            debug!(observer = %id, "observer detached");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Deliver an event to every currently attached observer. Observers
    /// whose channel is closed or full are detached; their failure never
    /// aborts the broadcast.
    pub async fn broadcast(&self, event: TaskEvent) {
        let snapshot: Vec<(Uuid, mpsc::Sender<TaskEvent>)> = {
            let observers = self.observers.read().await;
            observers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.try_send(event.clone()).is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut observers = self.observers.write().await;
            for id in dead {
                observers.remove(&id);
                debug!(observer = %id, "dropped unresponsive observer");
            }
        }
    }
}
