//! Admin read surface over tasks plus operator cancel, and the active port
//! reservation listing.

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    rows::{ReservationRow, TaskRow},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use meshperf_core::TaskStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/tasks", get(list_tasks))
        // Registered before the `:id` route so "ports" is not parsed as an id.
        .route("/v1/tasks/ports/reservations", get(list_reservations))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/tasks/:id/cancel", post(cancel_task))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub r#type: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<TaskRow>>> {
    let tasks: Vec<TaskRow> = sqlx::query_as(
        r#"
        SELECT * FROM tasks
        WHERE ($1::bigint IS NULL OR agent_id = $1)
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL OR type = $3)
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(query.agent_id)
    .bind(&query.status)
    .bind(&query.r#type)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<TaskRow>> {
    let task: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(&state.pool)
        .await?;

    task.map(Json).ok_or_else(|| ApiError::task_not_found(task_id))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
    pub task: TaskRow,
}

/// Operator cancel. Marks the task terminal in the store only; a running
/// agent coroutine is not interrupted, and its eventual report bounces off
/// the terminal-state check.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<CancelResponse>> {
    let mut tx = state.pool.begin().await?;

    let task: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(task) = task else {
        return Err(ApiError::task_not_found(task_id));
    };

    if TaskStatus::parse(&task.status).is_some_and(TaskStatus::is_terminal) {
        return Err(ApiError::task_already_terminal(&task.status));
    }

    let task: TaskRow = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = 'canceled',
            finished_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(event = "manager.task.canceled", task_id, "task canceled");
    Ok(Json(CancelResponse {
        canceled: true,
        task,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListReservationsQuery {
    #[serde(default)]
    pub agent_id: Option<i64>,
}

async fn list_reservations(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Query(query): Query<ListReservationsQuery>,
) -> ApiResult<Json<Vec<ReservationRow>>> {
    let reservations: Vec<ReservationRow> = sqlx::query_as(
        r#"
        SELECT * FROM port_reservations
        WHERE released_at IS NULL
          AND ($1::bigint IS NULL OR agent_id = $1)
        ORDER BY id
        "#,
    )
    .bind(query.agent_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(reservations))
}
