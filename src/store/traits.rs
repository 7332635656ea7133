//! Backend-agnostic `Database` trait.
//!
//! The stores above this layer (`IdentityPool`, `TaskStore`) persist
//! write-through on every mutating call: the durable collections are
//! reloaded at process start and rewritten as state changes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::{Identity, MailboxConfig};
use crate::tasks::Task;

/// Async persistence interface for the runner's durable collections.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Identities ──────────────────────────────────────────────────

    /// Insert or fully rewrite an identity record, keyed by handle.
    async fn upsert_identity(&self, identity: &Identity) -> Result<(), DatabaseError>;

    /// All identity records, in insertion order.
    async fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError>;

    // ── Mailbox configuration ───────────────────────────────────────

    /// The shared confirmation-mailbox parameters, if configured.
    async fn get_mailbox_config(&self) -> Result<Option<MailboxConfig>, DatabaseError>;

    /// Store (replace) the confirmation-mailbox parameters.
    async fn set_mailbox_config(&self, config: &MailboxConfig) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task record.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All task records, oldest first.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Fully rewrite a task record.
    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError>;
}
