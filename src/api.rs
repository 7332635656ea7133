//! REST endpoints for the operator surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::runner::Executor;
use crate::tasks::TaskStatus;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
}

/// Build the Axum router with the operator routes.
pub fn operator_routes(executor: Arc<Executor>) -> Router {
    let state = AppState { executor };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_tasks).get(list_tasks))
        .route("/api/tasks/run", post(run_tasks))
        .route("/api/tasks/cancel", post(cancel_all))
        .route("/api/identities", post(add_identity))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskpilot"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum SubmitBody {
    One(serde_json::Value),
    Many(Vec<serde_json::Value>),
}

async fn submit_tasks(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let payloads = match body {
        SubmitBody::Many(list) => list,
        SubmitBody::One(one) => vec![one],
    };

    let mut created = Vec::with_capacity(payloads.len());
    for payload in payloads {
        match state.executor.task_store().add(payload).await {
            Ok(task) => created.push(task),
            Err(e) => return internal_error(e),
        }
    }
    info!(count = created.len(), "Tasks submitted via API");
    (StatusCode::CREATED, Json(serde_json::json!({ "tasks": created }))).into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let filter = match query.status.as_deref() {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown status: {raw}") })),
                )
                    .into_response();
            }
        },
        None => None,
    };

    match state.executor.task_store().list(filter).await {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct RunBody {
    /// Explicit ids; omitted means every pending task.
    ids: Option<Vec<Uuid>>,
    #[serde(default)]
    parallel: bool,
    /// Worker count for a parallel run; defaults to the configured
    /// `max_workers`.
    workers: Option<usize>,
    /// Re-queue failed tasks into this batch (ignored when `ids` is given;
    /// an explicit id list already names what to retry).
    #[serde(default)]
    include_failed: bool,
}

async fn run_tasks(State(state): State<AppState>, Json(body): Json<RunBody>) -> impl IntoResponse {
    let executor = &state.executor;
    let workers = body.workers.unwrap_or(executor.config().max_workers);

    let report = match body.ids {
        Some(ids) => executor.run_by_ids(&ids, body.parallel, workers).await,
        None => {
            let parallel = body.parallel.then_some(workers);
            executor.run_outstanding(body.include_failed, parallel).await
        }
    };

    match report {
        Ok(report) => Json(serde_json::json!({ "report": report })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn cancel_all(State(state): State<AppState>) -> impl IntoResponse {
    match state.executor.cancel_all().await {
        Ok(cancelled) => Json(serde_json::json!({ "cancelled": cancelled })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Identities & stats ──────────────────────────────────────────────

#[derive(Deserialize)]
struct AddIdentityBody {
    handle: String,
    secret: String,
    #[serde(default)]
    config_ref: String,
}

async fn add_identity(
    State(state): State<AppState>,
    Json(body): Json<AddIdentityBody>,
) -> impl IntoResponse {
    match state
        .executor
        .identity_pool()
        .add(&body.handle, &body.secret, &body.config_ref)
        .await
    {
        Ok(identity) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "handle": identity.handle })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let identities = state.executor.identity_pool().stats().await;
    let sessions = state.executor.session_pool().stats();
    match state.executor.task_store().counts().await {
        Ok(tasks) => Json(serde_json::json!({
            "identities": identities,
            "sessions": sessions,
            "tasks": tasks,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
