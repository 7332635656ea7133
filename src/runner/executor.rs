//! The executor: single-task runs and batch modes.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::confirm::ConfirmationPoller;
use crate::error::{Error, TaskError};
use crate::identity::{Identity, IdentityPool};
use crate::runner::steps::{StepOutcome, Workflow};
use crate::session::SessionPool;
use crate::tasks::{Task, TaskStatus, TaskStore};

/// Aggregate result of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Requested tasks that were not runnable (unknown id or not in a
    /// pending/failed state).
    pub skipped: usize,
}

/// Drives tasks through acquire → run steps → confirm → release.
///
/// Every task-level failure is caught here and recorded on the task record;
/// only database failures propagate out of a batch.
pub struct Executor {
    identities: Arc<IdentityPool>,
    sessions: Arc<SessionPool>,
    poller: Arc<ConfirmationPoller>,
    tasks: Arc<TaskStore>,
    workflow: Arc<dyn Workflow>,
    config: RunnerConfig,
}

impl Executor {
    pub fn new(
        identities: Arc<IdentityPool>,
        sessions: Arc<SessionPool>,
        poller: Arc<ConfirmationPoller>,
        tasks: Arc<TaskStore>,
        workflow: Arc<dyn Workflow>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            identities,
            sessions,
            poller,
            tasks,
            workflow,
            config,
        }
    }

    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn identity_pool(&self) -> &Arc<IdentityPool> {
        &self.identities
    }

    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run a single task attempt to a terminal status.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` when the failure was
    /// recorded on the task. `Err` is reserved for store failures.
    pub async fn run_task(&self, task: &mut Task) -> Result<bool, Error> {
        info!(task_id = %task.id, "Processing task");

        let Some(identity) = self.identities.acquire(&HashSet::new()).await else {
            self.record_failure(task, &TaskError::NoIdentityAvailable)
                .await?;
            return Ok(false);
        };

        task.assigned_identity = Some(identity.handle.clone());
        if let Err(e) = self.tasks.transition(task, TaskStatus::Processing).await {
            // A store failure must not strand the handle in the in-use set.
            self.identities.release(&identity).await;
            return Err(e);
        }

        let outcome = self.drive(task, &identity).await;

        // Charge the quota before the handle goes back into rotation, so a
        // concurrent acquire can never observe a stale counter. Release on
        // every path; a release never masks the task outcome.
        let charged = match &outcome {
            Ok(_) => self.identities.mark_used(&identity).await,
            Err(TaskError::QuotaExhausted { .. }) => {
                self.identities.mark_exhausted(&identity).await
            }
            Err(_) => Ok(()),
        };
        self.identities.release(&identity).await;
        charged?;

        match outcome {
            Ok(result) => {
                task.result = result;
                self.tasks.transition(task, TaskStatus::Completed).await?;
                info!(task_id = %task.id, "Task completed");
                Ok(true)
            }
            Err(task_err) => {
                self.record_failure(task, &task_err).await?;
                Ok(false)
            }
        }
    }

    /// Session-scoped part of a run: acquire a session, drive the step
    /// sequence, then the optional confirmation. The session guard returns
    /// the slot on every exit path.
    async fn drive(
        &self,
        task: &Task,
        identity: &Identity,
    ) -> Result<Option<serde_json::Value>, TaskError> {
        let timeout = self.config.session_acquire_timeout;
        let Some(session) = self.sessions.acquire(timeout).await else {
            return Err(TaskError::SessionUnavailable { timeout });
        };

        let mut last_output = None;
        for step in self.workflow.steps(task) {
            match self.workflow.run_step(&session, identity, &step).await {
                StepOutcome::Completed(output) => {
                    if output.is_some() {
                        last_output = output;
                    }
                }
                StepOutcome::Failed(cause) => {
                    return Err(TaskError::StepFailed {
                        step: step.id,
                        cause,
                    });
                }
                StepOutcome::QuotaExhausted => {
                    return Err(TaskError::QuotaExhausted {
                        handle: identity.handle.clone(),
                    });
                }
            }
        }

        if self.workflow.needs_confirmation(task) {
            let code = self
                .poller
                .wait_for_code(
                    &identity.handle,
                    self.config.confirm_timeout,
                    self.config.confirm_poll_interval,
                    self.config.confirm_since_window,
                )
                .await
                .ok_or(TaskError::ConfirmationTimeout {
                    timeout: self.config.confirm_timeout,
                })?;

            match self
                .workflow
                .apply_confirmation(&session, identity, &code)
                .await
            {
                StepOutcome::Completed(output) => {
                    if output.is_some() {
                        last_output = output;
                    }
                }
                StepOutcome::Failed(cause) => {
                    return Err(TaskError::StepFailed {
                        step: "confirmation".into(),
                        cause,
                    });
                }
                StepOutcome::QuotaExhausted => {
                    return Err(TaskError::QuotaExhausted {
                        handle: identity.handle.clone(),
                    });
                }
            }
        }

        Ok(last_output)
    }

    async fn record_failure(&self, task: &mut Task, err: &TaskError) -> Result<(), Error> {
        warn!(task_id = %task.id, error = %err, "Task failed");
        task.error = Some(err.to_string());
        self.tasks.transition(task, TaskStatus::Failed).await
    }

    // ── Batch modes ─────────────────────────────────────────────────

    /// Run a batch one task at a time, with a randomized pause between
    /// attempts to avoid uniform timing against the target.
    pub async fn run_sequential(&self, mut tasks: Vec<Task>) -> Result<BatchReport, Error> {
        let total = tasks.len();
        info!(total, "Sequential batch starting");

        let mut report = BatchReport::default();
        for (index, task) in tasks.iter_mut().enumerate() {
            if task.status == TaskStatus::Failed {
                self.tasks.requeue(task).await?;
            }

            if self.run_task(task).await? {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            if index + 1 < total {
                let pause = self.config.batch_interval
                    + std::time::Duration::from_secs(
                        rand::thread_rng().gen_range(0..=self.config.batch_jitter_secs),
                    );
                info!(?pause, "Pacing before next task");
                tokio::time::sleep(pause).await;
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Sequential batch finished"
        );
        Ok(report)
    }

    /// Run a batch with bounded parallelism.
    ///
    /// Worker count is `min(requested, identities available today, task
    /// count)`. A count of zero falls back to sequential so work is never
    /// silently dropped.
    pub async fn run_parallel(
        &self,
        mut tasks: Vec<Task>,
        requested_workers: usize,
    ) -> Result<BatchReport, Error> {
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Failed {
                self.tasks.requeue(task).await?;
            }
        }

        let workers = requested_workers
            .min(self.identities.available_today().await)
            .min(tasks.len());

        if workers == 0 {
            warn!("No identities available for parallel workers, falling back to sequential");
            return self.run_sequential(tasks).await;
        }

        info!(total = tasks.len(), workers, "Parallel batch starting");

        let results: Vec<Result<bool, Error>> = futures::stream::iter(
            tasks
                .into_iter()
                .map(|mut task| async move { self.run_task(&mut task).await }),
        )
        .buffer_unordered(workers)
        .collect()
        .await;

        let mut report = BatchReport::default();
        for result in results {
            if result? {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Parallel batch finished"
        );
        Ok(report)
    }

    /// Run every pending task, optionally re-queuing failed ones first.
    pub async fn run_outstanding(
        &self,
        include_failed: bool,
        parallel: Option<usize>,
    ) -> Result<BatchReport, Error> {
        let mut tasks = self.tasks.list(Some(TaskStatus::Pending)).await?;
        if include_failed {
            tasks.extend(self.tasks.list(Some(TaskStatus::Failed)).await?);
        }
        if tasks.is_empty() {
            info!("No outstanding tasks");
            return Ok(BatchReport::default());
        }
        match parallel {
            Some(workers) => self.run_parallel(tasks, workers).await,
            None => self.run_sequential(tasks).await,
        }
    }

    /// Run an explicit id list. Ids that are unknown or not in a
    /// pending/failed state are counted as skipped.
    pub async fn run_by_ids(
        &self,
        ids: &[Uuid],
        parallel: bool,
        requested_workers: usize,
    ) -> Result<BatchReport, Error> {
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let tasks: Vec<Task> = self
            .tasks
            .list(None)
            .await?
            .into_iter()
            .filter(|t| {
                wanted.contains(&t.id)
                    && matches!(t.status, TaskStatus::Pending | TaskStatus::Failed)
            })
            .collect();

        let skipped = ids.len() - tasks.len();
        if tasks.is_empty() {
            return Ok(BatchReport {
                skipped,
                ..Default::default()
            });
        }

        let mut report = if parallel && tasks.len() > 1 {
            self.run_parallel(tasks, requested_workers).await?
        } else {
            self.run_sequential(tasks).await?
        };
        report.skipped = skipped;
        Ok(report)
    }

    /// Cancel every outstanding task. Cooperative: a worker already deep in
    /// its step sequence may still complete and overwrite the cancellation.
    pub async fn cancel_all(&self) -> Result<usize, Error> {
        self.tasks.cancel_all().await
    }
}
