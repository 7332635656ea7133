//! HTTP-backed external collaborator.
//!
//! The target-specific automation (which UI element to drive, in what
//! order) lives in a separate agent process. This module speaks to it over
//! a small JSON API: session contexts are created and destroyed remotely,
//! and each opaque step is shipped over as-is. The core never learns what
//! a step means.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::identity::Identity;
use crate::runner::steps::{StepOutcome, StepSpec, Workflow};
use crate::session::{Session, SessionContext, SessionFactory};
use crate::tasks::Task;

/// Client for the remote automation agent.
#[derive(Clone)]
pub struct HttpCollaborator {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Deserialize)]
struct StepReply {
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    cause: Option<String>,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_step(&self, path: &str, body: serde_json::Value) -> StepOutcome {
        let url = format!("{}{path}", self.base_url);
        let reply = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.json::<StepReply>().await,
                Err(e) => return StepOutcome::Failed(format!("agent returned {e}")),
            },
            Err(e) => return StepOutcome::Failed(format!("agent unreachable: {e}")),
        };

        match reply {
            Ok(reply) => match reply.status.as_str() {
                "completed" => StepOutcome::Completed(reply.output),
                "quota_exhausted" => StepOutcome::QuotaExhausted,
                _ => StepOutcome::Failed(
                    reply.cause.unwrap_or_else(|| "unspecified failure".into()),
                ),
            },
            Err(e) => StepOutcome::Failed(format!("malformed agent reply: {e}")),
        }
    }
}

/// A session context living in the remote agent.
struct RemoteSession {
    client: reqwest::Client,
    base_url: String,
    remote_id: String,
}

#[async_trait]
impl SessionContext for RemoteSession {
    fn reference(&self) -> &str {
        &self.remote_id
    }

    async fn close(&self) {
        let url = format!("{}/sessions/{}", self.base_url, self.remote_id);
        if let Err(e) = self.client.delete(&url).send().await {
            warn!(session = %self.remote_id, error = %e, "Remote session close failed");
        }
    }
}

#[async_trait]
impl SessionFactory for HttpCollaborator {
    async fn create(&self, id: u32) -> Result<Box<dyn SessionContext>, SessionError> {
        let url = format!("{}/sessions", self.base_url);
        let created: SessionCreated = self
            .client
            .post(&url)
            .json(&json!({ "pool_slot": id }))
            .send()
            .await
            .map_err(|e| SessionError::Create(format!("agent unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| SessionError::Create(e.to_string()))?
            .json()
            .await
            .map_err(|e| SessionError::Create(format!("malformed agent reply: {e}")))?;

        debug!(pool_slot = id, remote = %created.session_id, "Remote session created");
        Ok(Box::new(RemoteSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            remote_id: created.session_id,
        }))
    }
}

#[async_trait]
impl Workflow for HttpCollaborator {
    /// The task payload carries its own step list; anything else becomes a
    /// single opaque step the agent interprets whole.
    fn steps(&self, task: &Task) -> Vec<StepSpec> {
        match task.payload.get("steps").and_then(|v| v.as_array()) {
            Some(steps) => steps
                .iter()
                .enumerate()
                .map(|(index, step)| {
                    let id = step
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("step_{}", index + 1));
                    StepSpec::new(id, step.clone())
                })
                .collect(),
            None => vec![StepSpec::new("run", task.payload.clone())],
        }
    }

    fn needs_confirmation(&self, task: &Task) -> bool {
        task.payload
            .get("confirm")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    async fn run_step(
        &self,
        session: &Session,
        identity: &Identity,
        step: &StepSpec,
    ) -> StepOutcome {
        self.post_step(
            "/steps/run",
            json!({
                "session": session.context.reference(),
                "identity": identity.handle,
                "config_ref": identity.config_ref,
                "step_id": step.id,
                "action": step.action,
            }),
        )
        .await
    }

    async fn apply_confirmation(
        &self,
        session: &Session,
        identity: &Identity,
        code: &str,
    ) -> StepOutcome {
        self.post_step(
            "/steps/confirm",
            json!({
                "session": session.context.reference(),
                "identity": identity.handle,
                "code": code,
            }),
        )
        .await
    }
}
