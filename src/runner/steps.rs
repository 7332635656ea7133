//! The seam between the executor and the external collaborator.
//!
//! The core treats the target-specific workflow as an opaque, ordered list
//! of steps with tagged outcomes. It knows nothing about what a step does.

use async_trait::async_trait;

use crate::identity::Identity;
use crate::session::Session;
use crate::tasks::Task;

/// One opaque step of the external workflow.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Stable identifier, used in failure reporting.
    pub id: String,
    /// Collaborator-defined instruction payload.
    pub action: serde_json::Value,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, action: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }
}

/// Outcome of a single step, inspected by the executor. Failures are data,
/// not unwinding.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Step succeeded, optionally producing an output payload.
    Completed(Option<serde_json::Value>),
    /// Step failed with a cause string; aborts the task attempt.
    Failed(String),
    /// The target reported this identity's credits exhausted, distinct
    /// from the local daily counter.
    QuotaExhausted,
}

/// External collaborator driving the target through a session.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Expand a task's payload into its ordered step list.
    fn steps(&self, task: &Task) -> Vec<StepSpec>;

    /// Whether this task needs an out-of-band confirmation code after its
    /// steps complete.
    fn needs_confirmation(&self, task: &Task) -> bool;

    /// Run one step against the session on behalf of the identity.
    async fn run_step(
        &self,
        session: &Session,
        identity: &Identity,
        step: &StepSpec,
    ) -> StepOutcome;

    /// Submit a received confirmation code.
    async fn apply_confirmation(
        &self,
        session: &Session,
        identity: &Identity,
        code: &str,
    ) -> StepOutcome;
}
