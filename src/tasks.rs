//! Task records and the durable task store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{DatabaseError, Error, TaskError};
use crate::store::Database;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up.
    Pending,
    /// A worker is driving it.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed; retried only via an explicit re-queue.
    Failed,
    /// Cancelled by the operator. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // A pending task can fail without ever starting, e.g. when no
            // identity is available for the attempt.
            (Pending, Processing) | (Pending, Failed) | (Pending, Cancelled) |
            (Processing, Completed) | (Processing, Failed) | (Processing, Cancelled) |
            // Explicit retry re-queue only.
            (Failed, Pending)
        )
    }

    /// Terminal for a batch pass. `Failed` still leaves via the explicit
    /// re-queue path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Still eligible for work or cancellation.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of automation work.
///
/// The payload is opaque to the core; the collaborator turns it into an
/// ordered step list. Sessions are transient infrastructure and are never
/// recorded here; only the assigned identity is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_identity: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-status task counts for the operator surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable task collection with an enforced status state machine.
///
/// Every mutation is written through to the database immediately, so
/// in-flight state survives restarts. Tasks orphaned in `processing` by an
/// unclean shutdown are not auto-resumed; the operator re-queues them.
pub struct TaskStore {
    db: Arc<dyn Database>,
}

impl TaskStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append a new pending task.
    pub async fn add(&self, payload: serde_json::Value) -> Result<Task, DatabaseError> {
        let task = Task {
            id: Uuid::new_v4(),
            payload,
            status: TaskStatus::Pending,
            assigned_identity: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.db.insert_task(&task).await?;
        info!(task_id = %task.id, "Task added");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.db.get_task(id).await
    }

    /// List tasks, optionally filtered by status.
    pub async fn list(&self, filter: Option<TaskStatus>) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self.db.list_tasks().await?;
        Ok(match filter {
            Some(status) => tasks.into_iter().filter(|t| t.status == status).collect(),
            None => tasks,
        })
    }

    /// Validated status transition, persisted write-through.
    pub async fn transition(&self, task: &mut Task, to: TaskStatus) -> Result<(), Error> {
        if !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                state: task.status.to_string(),
                target: to.to_string(),
            }
            .into());
        }
        task.status = to;
        match to {
            TaskStatus::Processing => task.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                task.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }
        self.db.update_task(task).await?;
        Ok(())
    }

    /// Persist the current in-memory state of a task without a transition.
    pub async fn save(&self, task: &Task) -> Result<(), DatabaseError> {
        self.db.update_task(task).await
    }

    /// Explicit retry re-queue: `failed → pending`, clearing the recorded
    /// error and result.
    pub async fn requeue(&self, task: &mut Task) -> Result<(), Error> {
        task.error = None;
        task.result = None;
        task.assigned_identity = None;
        task.started_at = None;
        task.completed_at = None;
        self.transition(task, TaskStatus::Pending).await
    }

    /// Operator override for tasks orphaned in `processing` by an unclean
    /// shutdown: force them back to pending. Not part of the normal state
    /// machine and never called by the executor.
    pub async fn reset_orphaned(&self, task: &mut Task) -> Result<(), Error> {
        if task.status != TaskStatus::Processing {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                state: task.status.to_string(),
                target: TaskStatus::Pending.to_string(),
            }
            .into());
        }
        task.status = TaskStatus::Pending;
        task.error = None;
        task.result = None;
        task.assigned_identity = None;
        task.started_at = None;
        task.completed_at = None;
        self.db.update_task(task).await?;
        Ok(())
    }

    /// Cancel every pending and processing task. Advisory: a worker already
    /// deep in its step sequence may still complete and overwrite this.
    pub async fn cancel_all(&self) -> Result<usize, Error> {
        let mut cancelled = 0;
        for mut task in self.db.list_tasks().await? {
            if task.status.is_active() {
                self.transition(&mut task, TaskStatus::Cancelled).await?;
                cancelled += 1;
            }
        }
        info!(cancelled, "Cancelled outstanding tasks");
        Ok(cancelled)
    }

    pub async fn counts(&self) -> Result<TaskCounts, DatabaseError> {
        let mut counts = TaskCounts::default();
        for task in self.db.list_tasks().await? {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }
}
