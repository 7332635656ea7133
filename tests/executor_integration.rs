//! Integration tests for the executor pipeline.
//!
//! Each test wires the real executor against an in-memory database with
//! stub workflow, session and mailbox implementations, then checks the
//! recorded task and identity state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

use taskpilot::api::operator_routes;
use taskpilot::config::RunnerConfig;
use taskpilot::confirm::{ConfirmationPoller, MailMessage, Mailbox, UnconfiguredMailbox};
use taskpilot::error::{DatabaseError, MailboxError, SessionError};
use taskpilot::identity::{Identity, IdentityPool, IdentityStatus, MailboxConfig};
use taskpilot::runner::{Executor, StepOutcome, StepSpec, Workflow};
use taskpilot::session::{Session, SessionContext, SessionFactory, SessionPool};
use taskpilot::store::{Database, LibSqlBackend};
use taskpilot::tasks::{Task, TaskStatus, TaskStore};

struct StubContext;

#[async_trait]
impl SessionContext for StubContext {
    fn reference(&self) -> &str {
        "stub-session"
    }

    async fn close(&self) {}
}

struct StubFactory;

#[async_trait]
impl SessionFactory for StubFactory {
    async fn create(&self, _id: u32) -> Result<Box<dyn SessionContext>, SessionError> {
        Ok(Box::new(StubContext))
    }
}

struct FailingFactory;

#[async_trait]
impl SessionFactory for FailingFactory {
    async fn create(&self, _id: u32) -> Result<Box<dyn SessionContext>, SessionError> {
        Err(SessionError::Create("no capacity upstream".into()))
    }
}

/// Workflow stub driven by the task payload: `fail` fails the step,
/// `quota` reports target-side exhaustion, `confirm` requests a code.
/// Tracks the peak number of concurrently running steps.
struct StubWorkflow {
    running: AtomicUsize,
    max_seen: AtomicUsize,
    codes: Mutex<Vec<String>>,
}

impl StubWorkflow {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            codes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Workflow for StubWorkflow {
    fn steps(&self, task: &Task) -> Vec<StepSpec> {
        vec![StepSpec::new("work", task.payload.clone())]
    }

    fn needs_confirmation(&self, task: &Task) -> bool {
        task.payload
            .get("confirm")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    async fn run_step(
        &self,
        _session: &Session,
        _identity: &Identity,
        step: &StepSpec,
    ) -> StepOutcome {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(cause) = step.action.get("fail").and_then(|v| v.as_str()) {
            return StepOutcome::Failed(cause.to_string());
        }
        if step.action.get("quota").is_some() {
            return StepOutcome::QuotaExhausted;
        }
        StepOutcome::Completed(Some(json!({"step": step.id.clone()})))
    }

    async fn apply_confirmation(
        &self,
        _session: &Session,
        _identity: &Identity,
        code: &str,
    ) -> StepOutcome {
        self.codes.lock().unwrap().push(code.to_string());
        StepOutcome::Completed(Some(json!({"confirmed": code})))
    }
}

/// Mailbox stub that always has one message waiting.
struct CodeMailbox {
    to: String,
    body: String,
}

#[async_trait]
impl Mailbox for CodeMailbox {
    async fn recent_messages(
        &self,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<MailMessage>, MailboxError> {
        Ok(vec![MailMessage {
            to: self.to.clone(),
            body: self.body.clone(),
            received_at: Utc::now(),
        }])
    }
}

/// Backend wrapper that intercepts task status writes: optionally fails
/// the `processing` write, optionally pauses the `completed` write until
/// the test lets it through. Everything else passes straight down.
struct InterceptDb {
    inner: LibSqlBackend,
    fail_processing: bool,
    gate_completed: bool,
    reached_completed: Notify,
    proceed: Notify,
}

impl InterceptDb {
    async fn new(fail_processing: bool, gate_completed: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_processing,
            gate_completed,
            reached_completed: Notify::new(),
            proceed: Notify::new(),
        })
    }
}

#[async_trait]
impl Database for InterceptDb {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn upsert_identity(&self, identity: &Identity) -> Result<(), DatabaseError> {
        self.inner.upsert_identity(identity).await
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError> {
        self.inner.list_identities().await
    }

    async fn get_mailbox_config(&self) -> Result<Option<MailboxConfig>, DatabaseError> {
        self.inner.get_mailbox_config().await
    }

    async fn set_mailbox_config(&self, config: &MailboxConfig) -> Result<(), DatabaseError> {
        self.inner.set_mailbox_config(config).await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_tasks().await
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        if self.fail_processing && task.status == TaskStatus::Processing {
            return Err(DatabaseError::Query("update_task: disk I/O error".into()));
        }
        if self.gate_completed && task.status == TaskStatus::Completed {
            self.reached_completed.notify_one();
            self.proceed.notified().await;
        }
        self.inner.update_task(task).await
    }
}

/// Test config with pacing removed and short timeouts.
fn fast_config() -> RunnerConfig {
    RunnerConfig {
        daily_limit: 10,
        session_acquire_timeout: Duration::from_millis(300),
        session_poll_interval: Duration::from_millis(10),
        confirm_timeout: Duration::from_millis(300),
        confirm_poll_interval: Duration::from_millis(20),
        batch_interval: Duration::ZERO,
        batch_jitter_secs: 0,
        ..RunnerConfig::default()
    }
}

async fn stack(
    config: RunnerConfig,
    workflow: Arc<StubWorkflow>,
    factory: Arc<dyn SessionFactory>,
    mailbox: Box<dyn Mailbox>,
    handles: &[&str],
) -> Arc<Executor> {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    stack_on(db, config, workflow, factory, mailbox, handles).await
}

async fn stack_on(
    db: Arc<dyn Database>,
    config: RunnerConfig,
    workflow: Arc<StubWorkflow>,
    factory: Arc<dyn SessionFactory>,
    mailbox: Box<dyn Mailbox>,
    handles: &[&str],
) -> Arc<Executor> {
    let identities = Arc::new(
        IdentityPool::load(Arc::clone(&db), config.daily_limit)
            .await
            .unwrap(),
    );
    for handle in handles {
        identities.add(handle, "secret", "").await.unwrap();
    }

    let sessions = Arc::new(SessionPool::new(
        factory,
        config.session_pool_size,
        config.session_poll_interval,
    ));
    let poller = Arc::new(ConfirmationPoller::new(mailbox, config.confirm_scan_depth));
    let tasks = Arc::new(TaskStore::new(db));

    Arc::new(Executor::new(
        identities, sessions, poller, tasks, workflow, config,
    ))
}

async fn default_stack(handles: &[&str]) -> (Arc<Executor>, Arc<StubWorkflow>) {
    let workflow = StubWorkflow::new();
    let executor = stack(
        fast_config(),
        Arc::clone(&workflow),
        Arc::new(StubFactory),
        Box::new(UnconfiguredMailbox),
        handles,
    )
    .await;
    (executor, workflow)
}

#[tokio::test]
async fn completed_task_consumes_identity_quota() {
    let (executor, _) = default_stack(&["alice@example.test"]).await;

    let mut task = executor
        .task_store()
        .add(json!({"note": "hello"}))
        .await
        .unwrap();
    assert!(executor.run_task(&mut task).await.unwrap());

    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.assigned_identity.as_deref(), Some("alice@example.test"));
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.result, Some(json!({"step": "work"})));

    let identity = executor
        .identity_pool()
        .get("alice@example.test")
        .await
        .unwrap();
    assert_eq!(identity.daily_used, 1);
}

#[tokio::test]
async fn step_failure_is_recorded_without_consuming_quota() {
    let (executor, _) = default_stack(&["bob@example.test"]).await;

    let mut task = executor
        .task_store()
        .add(json!({"fail": "no dice"}))
        .await
        .unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("no dice"));

    // Quota untouched and the identity back in rotation.
    let identity = executor.identity_pool().get("bob@example.test").await.unwrap();
    assert_eq!(identity.daily_used, 0);
    assert!(
        executor
            .identity_pool()
            .acquire(&HashSet::new())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn no_identity_fails_the_task_before_processing() {
    let (executor, _) = default_stack(&[]).await;

    let mut task = executor.task_store().add(json!({})).await.unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.started_at.is_none());
    assert!(stored.error.as_deref().unwrap().contains("No identity"));
}

#[tokio::test]
async fn quota_exhaustion_flags_the_identity() {
    let (executor, _) = default_stack(&["carol@example.test"]).await;

    let mut task = executor
        .task_store()
        .add(json!({"quota": true}))
        .await
        .unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    let identity = executor
        .identity_pool()
        .get("carol@example.test")
        .await
        .unwrap();
    assert_eq!(identity.status, IdentityStatus::NoCredits);

    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("exhausted"));
}

#[tokio::test]
async fn parallel_batch_never_exceeds_identity_capacity() {
    let (executor, workflow) =
        default_stack(&["dave@example.test", "erin@example.test"]).await;

    for i in 0..6 {
        executor.task_store().add(json!({"n": i})).await.unwrap();
    }
    let tasks = executor
        .task_store()
        .list(Some(TaskStatus::Pending))
        .await
        .unwrap();

    // Five workers requested, but only two identities exist.
    let report = executor.run_parallel(tasks, 5).await.unwrap();
    assert_eq!(report.succeeded, 6);
    assert_eq!(report.failed, 0);
    assert!(workflow.max_seen.load(Ordering::SeqCst) <= 2);

    let counts = executor.task_store().counts().await.unwrap();
    assert_eq!(counts.completed, 6);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 0);
}

#[tokio::test]
async fn parallel_with_no_identities_falls_back_to_sequential() {
    let (executor, _) = default_stack(&[]).await;

    for i in 0..2 {
        executor.task_store().add(json!({"n": i})).await.unwrap();
    }
    let tasks = executor
        .task_store()
        .list(Some(TaskStatus::Pending))
        .await
        .unwrap();

    let report = executor.run_parallel(tasks, 3).await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 2);
}

#[tokio::test]
async fn confirmation_code_round_trip() {
    let workflow = StubWorkflow::new();
    let executor = stack(
        fast_config(),
        Arc::clone(&workflow),
        Arc::new(StubFactory),
        Box::new(CodeMailbox {
            to: "Frank@Example.test".to_string(),
            body: "Your code is 482910".to_string(),
        }),
        &["frank@example.test"],
    )
    .await;

    let mut task = executor
        .task_store()
        .add(json!({"confirm": true}))
        .await
        .unwrap();
    assert!(executor.run_task(&mut task).await.unwrap());

    assert_eq!(workflow.codes.lock().unwrap().as_slice(), ["482910"]);
    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.result, Some(json!({"confirmed": "482910"})));
}

#[tokio::test]
async fn missing_confirmation_times_out_the_task() {
    let (executor, workflow) = default_stack(&["grace@example.test"]).await;

    let mut task = executor
        .task_store()
        .add(json!({"confirm": true}))
        .await
        .unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    assert!(workflow.codes.lock().unwrap().is_empty());
    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(
        stored
            .error
            .as_deref()
            .unwrap()
            .contains("Confirmation code not received")
    );
}

#[tokio::test]
async fn session_creation_failure_fails_the_task() {
    let workflow = StubWorkflow::new();
    let executor = stack(
        fast_config(),
        Arc::clone(&workflow),
        Arc::new(FailingFactory),
        Box::new(UnconfiguredMailbox),
        &["heidi@example.test"],
    )
    .await;

    let mut task = executor.task_store().add(json!({})).await.unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("No session available"));

    // The failed attempt must hand its identity back.
    assert!(
        executor
            .identity_pool()
            .acquire(&HashSet::new())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn cancel_all_leaves_completed_tasks_alone() {
    let (executor, _) = default_stack(&["ivy@example.test"]).await;

    let mut done = executor.task_store().add(json!({})).await.unwrap();
    assert!(executor.run_task(&mut done).await.unwrap());
    executor.task_store().add(json!({})).await.unwrap();
    executor.task_store().add(json!({})).await.unwrap();

    assert_eq!(executor.cancel_all().await.unwrap(), 2);

    let stored = executor.task_store().get(done.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    let counts = executor.task_store().counts().await.unwrap();
    assert_eq!(counts.cancelled, 2);
}

#[tokio::test]
async fn quota_is_charged_before_the_identity_returns_to_rotation() {
    let intercept = InterceptDb::new(false, true).await;
    let db: Arc<dyn Database> = Arc::clone(&intercept) as Arc<dyn Database>;

    let config = RunnerConfig {
        daily_limit: 1,
        ..fast_config()
    };
    let executor = stack_on(
        db,
        config,
        StubWorkflow::new(),
        Arc::new(StubFactory),
        Box::new(UnconfiguredMailbox),
        &["solo@example.test"],
    )
    .await;

    let mut task = executor.task_store().add(json!({})).await.unwrap();
    let worker = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.run_task(&mut task).await })
    };

    // The worker is paused inside the completed-status write. Its identity
    // is already back in rotation at this point, so the daily charge must
    // be visible too: with a limit of one, no acquire may succeed.
    intercept.reached_completed.notified().await;
    assert!(
        executor
            .identity_pool()
            .acquire(&HashSet::new())
            .await
            .is_none()
    );

    intercept.proceed.notify_one();
    assert!(worker.await.unwrap().unwrap());

    let solo = executor
        .identity_pool()
        .get("solo@example.test")
        .await
        .unwrap();
    assert_eq!(solo.daily_used, 1);
}

#[tokio::test]
async fn store_failure_while_starting_returns_the_identity() {
    let intercept = InterceptDb::new(true, false).await;
    let db: Arc<dyn Database> = Arc::clone(&intercept) as Arc<dyn Database>;

    let executor = stack_on(
        db,
        fast_config(),
        StubWorkflow::new(),
        Arc::new(StubFactory),
        Box::new(UnconfiguredMailbox),
        &["kim@example.test"],
    )
    .await;

    let mut task = executor.task_store().add(json!({})).await.unwrap();
    assert!(executor.run_task(&mut task).await.is_err());

    // The propagated store error must not strand the identity in use.
    assert!(
        executor
            .identity_pool()
            .acquire(&HashSet::new())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn api_run_defaults_to_configured_worker_count() {
    let config = RunnerConfig {
        max_workers: 2,
        ..fast_config()
    };
    let workflow = StubWorkflow::new();
    let executor = stack(
        config,
        Arc::clone(&workflow),
        Arc::new(StubFactory),
        Box::new(UnconfiguredMailbox),
        &["a@example.test", "b@example.test", "c@example.test"],
    )
    .await;
    for i in 0..6 {
        executor.task_store().add(json!({"n": i})).await.unwrap();
    }

    let app = operator_routes(Arc::clone(&executor));
    let request = Request::post("/api/tasks/run")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"parallel": true}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Three identities could carry three workers; the configured limit of
    // two must cap concurrency instead.
    assert!(workflow.max_seen.load(Ordering::SeqCst) <= 2);
    let counts = executor.task_store().counts().await.unwrap();
    assert_eq!(counts.completed, 6);
}

#[tokio::test]
async fn run_outstanding_retries_failed_tasks_when_asked() {
    let (executor, _) = default_stack(&["judy@example.test"]).await;

    let mut task = executor
        .task_store()
        .add(json!({"fail": "flaky"}))
        .await
        .unwrap();
    assert!(!executor.run_task(&mut task).await.unwrap());

    // A plain pass skips the failed task entirely.
    let report = executor.run_outstanding(false, None).await.unwrap();
    assert_eq!(report.succeeded + report.failed, 0);

    // Re-queued tasks run again; still failing, but with a fresh attempt.
    let report = executor.run_outstanding(true, None).await.unwrap();
    assert_eq!(report.failed, 1);
    let stored = executor.task_store().get(task.id).await.unwrap().unwrap();
    assert!(stored.error.as_deref().unwrap().contains("flaky"));
}
