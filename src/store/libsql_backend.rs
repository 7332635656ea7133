//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Records are written as
//! whole rows: the stores above rewrite a record on every mutation rather
//! than patching individual columns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::{Identity, IdentityStatus, MailboxConfig};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::{Task, TaskStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    Utc::now()
}

fn opt_datetime(value: Option<&String>) -> Option<DateTime<Utc>> {
    value.map(|s| parse_datetime(s))
}

fn row_to_identity(row: &libsql::Row) -> Result<Identity, DatabaseError> {
    let handle: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("identity handle: {e}")))?;
    let secret: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("identity secret: {e}")))?;
    let daily_used: i64 = row.get(2).unwrap_or(0);
    let last_used_date: Option<String> = row.get(3).ok();
    let status: String = row.get::<String>(4).unwrap_or_else(|_| "active".into());
    let config_ref: String = row.get::<String>(5).unwrap_or_default();
    let created_at: String = row.get::<String>(6).unwrap_or_default();

    Ok(Identity {
        handle,
        secret,
        daily_used: daily_used.max(0) as u32,
        last_used_date: last_used_date
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        status: IdentityStatus::parse(&status),
        config_ref,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?;
    let payload: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?;
    let status: String = row.get::<String>(2).unwrap_or_else(|_| "pending".into());
    let assigned_identity: Option<String> = row.get(3).ok();
    let result: Option<String> = row.get(4).ok();
    let error: Option<String> = row.get(5).ok();
    let created_at: String = row.get::<String>(6).unwrap_or_default();
    let started_at: Option<String> = row.get(7).ok();
    let completed_at: Option<String> = row.get(8).ok();

    Ok(Task {
        id: Uuid::parse_str(&id)
            .map_err(|e| DatabaseError::Serialization(format!("task id {id}: {e}")))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        assigned_identity,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error,
        created_at: parse_datetime(&created_at),
        started_at: opt_datetime(started_at.as_ref()),
        completed_at: opt_datetime(completed_at.as_ref()),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Identities ──────────────────────────────────────────────────

    async fn upsert_identity(&self, identity: &Identity) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO identities
                    (handle, secret, daily_used, last_used_date, status, config_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(handle) DO UPDATE SET
                    secret = excluded.secret,
                    daily_used = excluded.daily_used,
                    last_used_date = excluded.last_used_date,
                    status = excluded.status,
                    config_ref = excluded.config_ref",
                params![
                    identity.handle.clone(),
                    identity.secret.clone(),
                    identity.daily_used as i64,
                    identity
                        .last_used_date
                        .map(|d| d.format("%Y-%m-%d").to_string()),
                    identity.status.as_str(),
                    identity.config_ref.clone(),
                    identity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_identity: {e}")))?;
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT handle, secret, daily_used, last_used_date, status, config_ref, created_at
                 FROM identities ORDER BY created_at, handle",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_identities: {e}")))?;

        let mut identities = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_identities row: {e}")))?
        {
            identities.push(row_to_identity(&row)?);
        }
        Ok(identities)
    }

    // ── Mailbox configuration ───────────────────────────────────────

    async fn get_mailbox_config(&self) -> Result<Option<MailboxConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT host, port, username, secret, domain FROM mailbox_config WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_mailbox_config: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_mailbox_config row: {e}")))?
        else {
            return Ok(None);
        };

        let host: String = row
            .get(0)
            .map_err(|e| DatabaseError::Serialization(format!("mailbox host: {e}")))?;
        let port: i64 = row.get(1).unwrap_or(993);
        let username: String = row.get::<String>(2).unwrap_or_default();
        let secret: String = row.get::<String>(3).unwrap_or_default();
        let domain: String = row.get::<String>(4).unwrap_or_default();

        Ok(Some(MailboxConfig {
            host,
            port: port as u16,
            username,
            secret: SecretString::from(secret),
            domain,
        }))
    }

    async fn set_mailbox_config(&self, config: &MailboxConfig) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mailbox_config (id, host, port, username, secret, domain)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    host = excluded.host,
                    port = excluded.port,
                    username = excluded.username,
                    secret = excluded.secret,
                    domain = excluded.domain",
                params![
                    config.host.clone(),
                    i64::from(config.port),
                    config.username.clone(),
                    config.secret.expose_secret(),
                    config.domain.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_mailbox_config: {e}")))?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO tasks
                    (id, payload, status, assigned_identity, result, error,
                     created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id.to_string(),
                    payload,
                    task.status.as_str(),
                    task.assigned_identity.clone(),
                    task.result
                        .as_ref()
                        .and_then(|v| serde_json::to_string(v).ok()),
                    task.error.clone(),
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, payload, status, assigned_identity, result, error,
                        created_at, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, payload, status, assigned_identity, result, error,
                        created_at, started_at, completed_at
                 FROM tasks ORDER BY created_at, id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?;
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    payload = ?2,
                    status = ?3,
                    assigned_identity = ?4,
                    result = ?5,
                    error = ?6,
                    started_at = ?7,
                    completed_at = ?8
                 WHERE id = ?1",
                params![
                    task.id.to_string(),
                    payload,
                    task.status.as_str(),
                    task.assigned_identity.clone(),
                    task.result
                        .as_ref()
                        .and_then(|v| serde_json::to_string(v).ok()),
                    task.error.clone(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn identity_roundtrip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let identity = Identity {
            handle: "a@x.test".into(),
            secret: "s3cret".into(),
            daily_used: 2,
            last_used_date: Some(NaiveDate::from_ymd_opt(2026, 8, 30).unwrap()),
            status: IdentityStatus::Cooldown,
            config_ref: "fp-77".into(),
            created_at: Utc::now(),
        };
        db.upsert_identity(&identity).await.unwrap();

        let loaded = db.list_identities().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].handle, "a@x.test");
        assert_eq!(loaded[0].daily_used, 2);
        assert_eq!(loaded[0].status, IdentityStatus::Cooldown);
        assert_eq!(loaded[0].config_ref, "fp-77");
        assert_eq!(
            loaded[0].last_used_date,
            Some(NaiveDate::from_ymd_opt(2026, 8, 30).unwrap())
        );
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_identity() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut identity = Identity {
            handle: "a@x.test".into(),
            secret: "s".into(),
            daily_used: 0,
            last_used_date: None,
            status: IdentityStatus::Active,
            config_ref: String::new(),
            created_at: Utc::now(),
        };
        db.upsert_identity(&identity).await.unwrap();
        identity.daily_used = 3;
        identity.status = IdentityStatus::NoCredits;
        db.upsert_identity(&identity).await.unwrap();

        let loaded = db.list_identities().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].daily_used, 3);
        assert_eq!(loaded[0].status, IdentityStatus::NoCredits);
    }

    #[tokio::test]
    async fn mailbox_config_roundtrip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.get_mailbox_config().await.unwrap().is_none());

        let config = MailboxConfig {
            host: "imap.x.test".into(),
            port: 993,
            username: "catchall@x.test".into(),
            secret: SecretString::from("hunter2"),
            domain: "x.test".into(),
        };
        db.set_mailbox_config(&config).await.unwrap();

        let loaded = db.get_mailbox_config().await.unwrap().unwrap();
        assert_eq!(loaded.host, "imap.x.test");
        assert_eq!(loaded.port, 993);
        assert_eq!(loaded.secret.expose_secret(), "hunter2");
        assert_eq!(loaded.domain, "x.test");
    }

    #[tokio::test]
    async fn task_roundtrip_preserves_all_fields() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let task = Task {
            id: Uuid::new_v4(),
            payload: json!({"image": "frame_001.png", "prompt": "pan left"}),
            status: TaskStatus::Failed,
            assigned_identity: Some("a@x.test".into()),
            result: Some(json!({"url": "https://cdn.x.test/out.mp4"})),
            error: Some("step upload failed".into()),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
        };
        db.insert_task(&task).await.unwrap();

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, task.payload);
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.assigned_identity.as_deref(), Some("a@x.test"));
        assert_eq!(loaded.result, task.result);
        assert_eq!(loaded.error.as_deref(), Some("step upload failed"));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskpilot.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_identity(&Identity {
                handle: "kept@x.test".into(),
                secret: "s".into(),
                daily_used: 1,
                last_used_date: None,
                status: IdentityStatus::Active,
                config_ref: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        // Reopen runs migrations again; they must be a no-op.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.list_identities().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].handle, "kept@x.test");
        assert_eq!(loaded[0].daily_used, 1);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let task = Task {
            id: Uuid::new_v4(),
            payload: json!({}),
            status: TaskStatus::Pending,
            assigned_identity: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let err = db.update_task(&task).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
