//! The agent protocol: register, heartbeat, claim, started, result.
//!
//! Auth contract on every endpoint: `X-AGENT-NAME` + `X-AGENT-KEY`. A
//! missing or disabled agent row answers 404 `agent_not_found`, which the
//! agent treats as the must-exit signal; a wrong key is 401 and transient.
//! Mutating endpoints honor `Idempotency-Key` by replaying the first
//! response body verbatim.

use crate::{
    error::{ApiError, ApiResult},
    idempotency,
    rows::{AgentRow, TaskRow},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use meshperf_core::{
    protocol::{
        HeartbeatRequest, RegisterRequest, TaskResultRequest, TaskStartedRequest,
        AGENT_KEY_HEADER, AGENT_NAME_HEADER, IDEMPOTENCY_KEY_HEADER,
    },
    TaskStatus, TaskType,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/agent/register", post(register))
        .route("/v1/agent/heartbeat", post(heartbeat))
        .route("/v1/agent/tasks/claim", post(claim_task))
        .route("/v1/agent/tasks/:id/started", post(task_started))
        .route("/v1/agent/tasks/:id/result", post(task_result))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AgentRow, ApiError> {
    let name = header_value(headers, AGENT_NAME_HEADER);
    let key = header_value(headers, AGENT_KEY_HEADER);

    let (Some(name), Some(key)) = (name, key) else {
        return Err(ApiError::missing_agent_headers());
    };

    let agent: Option<AgentRow> =
        sqlx::query_as("SELECT * FROM agents WHERE name = $1 AND NOT disabled")
            .bind(&name)
            .fetch_optional(&state.pool)
            .await?;
    let Some(agent) = agent else {
        return Err(ApiError::agent_must_exit());
    };

    if agent.registration_key != key {
        return Err(ApiError::invalid_agent_key());
    }

    Ok(agent)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    header_value(headers, IDEMPOTENCY_KEY_HEADER)
}

async fn replay(state: &AppState, key: Option<&str>, endpoint: &str) -> ApiResult<Option<Value>> {
    let Some(key) = key else { return Ok(None) };
    idempotency::cached_response(&state.pool, key, endpoint)
        .await
        .map_err(ApiError::internal)
}

async fn remember(
    state: &AppState,
    key: Option<&str>,
    endpoint: &str,
    response: &Value,
) -> ApiResult<()> {
    if let Some(key) = key {
        idempotency::store_response(&state.pool, key, endpoint, response)
            .await
            .map_err(ApiError::internal)?;
    }
    Ok(())
}

async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    let agent = authenticate(&state, &headers).await?;

    let key = idempotency_key(&headers);
    if let Some(cached) = replay(&state, key.as_deref(), "register").await? {
        return Ok(Json(cached));
    }

    let agent: AgentRow = sqlx::query_as(
        r#"
        UPDATE agents
        SET status = 'online',
            last_heartbeat = now(),
            ip_address = $2,
            operating_system = COALESCE($3, operating_system)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(agent.id)
    .bind(&req.ip_address)
    .bind(&req.operating_system)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        event = "manager.agent.registered",
        agent = %agent.name,
        ip = %req.ip_address,
        "agent registered"
    );

    let body = serde_json::to_value(&agent).map_err(ApiError::internal)?;
    remember(&state, key.as_deref(), "register", &body).await?;
    Ok(Json(body))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<Value>> {
    let agent = authenticate(&state, &headers).await?;

    let key = idempotency_key(&headers);
    if let Some(cached) = replay(&state, key.as_deref(), "heartbeat").await? {
        return Ok(Json(cached));
    }

    sqlx::query(
        r#"
        UPDATE agents
        SET status = 'online',
            last_heartbeat = now(),
            ip_address = $2
        WHERE id = $1
        "#,
    )
    .bind(agent.id)
    .bind(&req.ip_address)
    .execute(&state.pool)
    .await?;

    tracing::debug!(
        event = "manager.agent.heartbeat",
        agent = %agent.name,
        running = req.running.len(),
        "heartbeat"
    );

    // The hint is currently constant; a future scheduler could use it for
    // backpressure.
    let body = json!({"pull_tasks": true});
    remember(&state, key.as_deref(), "heartbeat", &body).await?;
    Ok(Json(body))
}

/// The scheduler's critical section: pick the oldest pending task for this
/// agent and flip it to accepted in one locked statement. `SKIP LOCKED`
/// means two racing claims can never see the same row; the loser either
/// takes the next task or gets null.
async fn claim_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let agent = authenticate(&state, &headers).await?;

    let mut tx = state.pool.begin().await.map_err(ApiError::claim_failed)?;

    let task: Option<TaskRow> = sqlx::query_as(
        r#"
        WITH picked AS (
          SELECT id
          FROM tasks
          WHERE agent_id = $1
            AND status = 'pending'
          ORDER BY created_at, id
          LIMIT 1
          FOR UPDATE SKIP LOCKED
        )
        UPDATE tasks AS t
        SET status = 'accepted',
            accepted_at = now()
        FROM picked
        WHERE t.id = picked.id
        RETURNING t.*
        "#,
    )
    .bind(agent.id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::claim_failed)?;

    tx.commit().await.map_err(ApiError::claim_failed)?;

    if let Some(task) = &task {
        tracing::info!(
            event = "manager.task.claimed",
            agent = %agent.name,
            task_id = task.id,
            task_type = %task.r#type,
            "task claimed"
        );
    }

    Ok(Json(json!({"task": task})))
}

async fn task_started(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(req): Json<TaskStartedRequest>,
) -> ApiResult<Json<Value>> {
    let agent = authenticate(&state, &headers).await?;

    let key = idempotency_key(&headers);
    if let Some(cached) = replay(&state, key.as_deref(), "task_started").await? {
        return Ok(Json(cached));
    }

    let mut tx = state.pool.begin().await?;

    let task = fetch_agent_task(&mut tx, task_id, agent.id).await?;
    if task.status != TaskStatus::Accepted.as_str() {
        return Err(ApiError::invalid_task_state(&task.status, "accepted"));
    }

    let task: TaskRow = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = 'running',
            started_at = now(),
            payload = CASE
                WHEN $2::bigint IS NULL THEN payload
                ELSE payload || jsonb_build_object('pid', $2::bigint)
            END
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(task_id)
    .bind(req.pid.map(i64::from))
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        event = "manager.task.started",
        agent = %agent.name,
        task_id,
        "task running"
    );

    let body = serde_json::to_value(&task).map_err(ApiError::internal)?;
    remember(&state, key.as_deref(), "task_started", &body).await?;
    Ok(Json(body))
}

async fn task_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(req): Json<TaskResultRequest>,
) -> ApiResult<Json<Value>> {
    let agent = authenticate(&state, &headers).await?;

    let key = idempotency_key(&headers);
    if let Some(cached) = replay(&state, key.as_deref(), "task_result").await? {
        return Ok(Json(cached));
    }

    let mut tx = state.pool.begin().await?;

    let task = fetch_agent_task(&mut tx, task_id, agent.id).await?;

    // `timed_out` is accepted so a result that lands just after the sweeper
    // fired is not lost; operator-canceled tasks stay canceled.
    let resubmittable = matches!(
        TaskStatus::parse(&task.status),
        Some(TaskStatus::Running | TaskStatus::Accepted | TaskStatus::TimedOut)
    );
    if !resubmittable {
        return Err(ApiError::invalid_task_state(
            &task.status,
            "running, accepted, or timed_out",
        ));
    }

    let error = if req.status == TaskStatus::Failed {
        Some(req.stderr.clone())
    } else {
        None
    };

    let task: TaskRow = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = $2,
            result = $3,
            error = $4,
            finished_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(task_id)
    .bind(req.status.as_str())
    .bind(&req.result)
    .bind(&error)
    .fetch_one(&mut *tx)
    .await?;

    // A server task reaching a terminal state frees its port inline rather
    // than waiting for the cleanup sweep.
    if task.r#type == TaskType::IperfServerStart.as_str() && req.status.is_terminal() {
        sqlx::query(
            r#"
            UPDATE port_reservations
            SET released_at = now()
            WHERE task_id = $1
              AND released_at IS NULL
            "#,
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::info!(
        event = "manager.task.result",
        agent = %agent.name,
        task_id,
        status = %task.status,
        exit_code = req.exit_code,
        "task result stored"
    );

    let body = serde_json::to_value(&task).map_err(ApiError::internal)?;
    remember(&state, key.as_deref(), "task_result", &body).await?;
    Ok(Json(body))
}

async fn fetch_agent_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task_id: i64,
    agent_id: i64,
) -> Result<TaskRow, ApiError> {
    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND agent_id = $2 FOR UPDATE")
            .bind(task_id)
            .bind(agent_id)
            .fetch_optional(&mut **tx)
            .await?;

    task.ok_or_else(|| ApiError::task_not_assigned(task_id))
}
