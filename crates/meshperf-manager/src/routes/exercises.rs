//! Admin surface for exercises: composition, the start/stop lifecycle, and
//! the results projection.

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    rows::{AgentRow, ExerciseRow, TaskRow, TestRow},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use meshperf_core::report::{client_metrics, ClientMetrics};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/exercises", post(create_exercise).get(list_exercises))
        .route("/v1/exercises/:id", get(get_exercise))
        .route("/v1/exercises/:id/tests", post(add_test))
        .route("/v1/exercises/:id/start", post(start_exercise))
        .route("/v1/exercises/:id/stop", post(stop_exercise))
        .route("/v1/exercises/:id/results", get(exercise_results))
}

#[derive(Debug, Deserialize)]
pub struct CreateExerciseRequest {
    pub name: String,
    #[serde(default = "default_duration")]
    pub duration_seconds: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_duration() -> i64 {
    30
}

async fn create_exercise(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Json(req): Json<CreateExerciseRequest>,
) -> ApiResult<(StatusCode, Json<ExerciseRow>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("exercise name must not be empty"));
    }
    if req.duration_seconds <= 0 {
        return Err(ApiError::validation("duration_seconds must be positive"));
    }

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM exercises WHERE name = $1")
        .bind(&req.name)
        .fetch_optional(&state.pool)
        .await?;
    if existing.is_some() {
        return Err(ApiError::duplicate_exercise_name(&req.name));
    }

    let exercise: ExerciseRow = sqlx::query_as(
        r#"
        INSERT INTO exercises (name, duration_seconds, notes)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(&req.name)
    .bind(req.duration_seconds)
    .bind(&req.notes)
    .fetch_one(&state.pool)
    .await
    .map_err(|err| {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return ApiError::duplicate_exercise_name(&req.name);
            }
        }
        ApiError::internal(err)
    })?;

    tracing::info!(event = "manager.exercise.created", exercise = %exercise.name, "exercise created");
    Ok((StatusCode::CREATED, Json(exercise)))
}

async fn list_exercises(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
) -> ApiResult<Json<Vec<ExerciseRow>>> {
    let exercises: Vec<ExerciseRow> = sqlx::query_as("SELECT * FROM exercises ORDER BY id")
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(exercises))
}

#[derive(Debug, Serialize)]
pub struct ExerciseDetail {
    #[serde(flatten)]
    pub exercise: ExerciseRow,
    pub tests: Vec<TestRow>,
    pub tasks: Vec<TaskRow>,
}

async fn get_exercise(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(exercise_id): Path<i64>,
) -> ApiResult<Json<ExerciseDetail>> {
    let exercise = fetch_exercise(&state, exercise_id).await?;
    let tests = fetch_tests(&state, exercise_id).await?;

    let tasks: Vec<TaskRow> = sqlx::query_as(
        r#"
        SELECT * FROM tasks
        WHERE id IN (
            SELECT server_task_id FROM tests WHERE exercise_id = $1 AND server_task_id IS NOT NULL
            UNION
            SELECT client_task_id FROM tests WHERE exercise_id = $1 AND client_task_id IS NOT NULL
        )
        ORDER BY id
        "#,
    )
    .bind(exercise_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(ExerciseDetail {
        exercise,
        tests,
        tasks,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddTestRequest {
    pub server_agent_id: i64,
    pub client_agent_id: i64,
    pub server_port: i32,
    #[serde(default)]
    pub udp: bool,
    #[serde(default = "default_parallel")]
    pub parallel: i32,
    #[serde(default)]
    pub time_seconds: Option<i64>,
}

fn default_parallel() -> i32 {
    1
}

#[derive(Debug, Serialize)]
pub struct AddTestResponse {
    pub test: TestRow,
    pub server_task: TaskRow,
    pub client_task: TaskRow,
}

/// Adding a test creates four rows atomically: the test itself, both tasks
/// (queued until exercise start), and the server port reservation.
async fn add_test(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(exercise_id): Path<i64>,
    Json(req): Json<AddTestRequest>,
) -> ApiResult<(StatusCode, Json<AddTestResponse>)> {
    if !(1..=32).contains(&req.parallel) {
        return Err(ApiError::validation("parallel must be between 1 and 32"));
    }
    if !(1..=65535).contains(&req.server_port) {
        return Err(ApiError::validation("server_port must be a valid port"));
    }
    if let Some(time) = req.time_seconds {
        if time <= 0 {
            return Err(ApiError::validation("time_seconds must be positive"));
        }
    }

    let exercise = fetch_exercise(&state, exercise_id).await?;

    let server_agent: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = $1")
        .bind(req.server_agent_id)
        .fetch_optional(&state.pool)
        .await?;
    let Some(server_agent) = server_agent else {
        return Err(ApiError::agent_not_found(req.server_agent_id));
    };

    let client_agent: Option<(i64,)> = sqlx::query_as("SELECT id FROM agents WHERE id = $1")
        .bind(req.client_agent_id)
        .fetch_optional(&state.pool)
        .await?;
    if client_agent.is_none() {
        return Err(ApiError::agent_not_found(req.client_agent_id));
    }

    let live: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM port_reservations
        WHERE agent_id = $1
          AND port = $2
          AND released_at IS NULL
        "#,
    )
    .bind(req.server_agent_id)
    .bind(req.server_port)
    .fetch_optional(&state.pool)
    .await?;
    if live.is_some() {
        return Err(ApiError::port_reservation_conflict(
            req.server_agent_id,
            req.server_port,
        ));
    }

    let time_seconds = req.time_seconds.unwrap_or(exercise.duration_seconds);

    let mut tx = state.pool.begin().await?;

    let test: TestRow = sqlx::query_as(
        r#"
        INSERT INTO tests (
            exercise_id, server_agent_id, client_agent_id,
            server_port, udp, parallel, time_seconds
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(exercise_id)
    .bind(req.server_agent_id)
    .bind(req.client_agent_id)
    .bind(req.server_port)
    .bind(req.udp)
    .bind(req.parallel)
    .bind(time_seconds)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| map_unique_violation(err, &req))?;

    let server_task: TaskRow = sqlx::query_as(
        r#"
        INSERT INTO tasks (type, agent_id, status, payload)
        VALUES ('iperf_server_start', $1, 'queued', $2)
        RETURNING *
        "#,
    )
    .bind(req.server_agent_id)
    .bind(json!({"port": req.server_port, "udp": req.udp}))
    .fetch_one(&mut *tx)
    .await?;

    // The client payload captures the server agent's last-known IP; a never
    // -registered server agent falls back to loopback.
    let server_ip = server_agent
        .ip_address
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let client_task: TaskRow = sqlx::query_as(
        r#"
        INSERT INTO tasks (type, agent_id, status, payload)
        VALUES ('iperf_client_run', $1, 'queued', $2)
        RETURNING *
        "#,
    )
    .bind(req.client_agent_id)
    .bind(json!({
        "server_ip": server_ip,
        "port": req.server_port,
        "udp": req.udp,
        "parallel": req.parallel,
        "time": time_seconds,
        "client_delay_seconds": state.cfg.client_delay_seconds,
        "max_retries": state.cfg.client_max_retries,
        "retry_delay_seconds": state.cfg.client_retry_delay_seconds,
    }))
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO port_reservations (agent_id, port, task_id)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(req.server_agent_id)
    .bind(req.server_port)
    .bind(server_task.id)
    .execute(&mut *tx)
    .await
    .map_err(|err| map_unique_violation(err, &req))?;

    let test: TestRow = sqlx::query_as(
        r#"
        UPDATE tests
        SET server_task_id = $2,
            client_task_id = $3
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(test.id)
    .bind(server_task.id)
    .bind(client_task.id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        event = "manager.test.added",
        exercise_id,
        test_id = test.id,
        server_task_id = server_task.id,
        client_task_id = client_task.id,
        "test added"
    );

    Ok((
        StatusCode::CREATED,
        Json(AddTestResponse {
            test,
            server_task,
            client_task,
        }),
    ))
}

/// Map a unique-index violation on the reservation (or the per-exercise
/// port constraint) to the conflict the pre-check would have reported. Two
/// racing add-test calls both pass the pre-check; the index settles it.
fn map_unique_violation(err: sqlx::Error, req: &AddTestRequest) -> ApiError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return ApiError::port_reservation_conflict(req.server_agent_id, req.server_port);
        }
    }
    ApiError::internal(err)
}

/// The single admission gate: before start, nothing is claimable; after,
/// every queued task of the exercise becomes pending in the same
/// transaction that stamps `started_at`.
async fn start_exercise(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(exercise_id): Path<i64>,
) -> ApiResult<Json<ExerciseRow>> {
    let mut tx = state.pool.begin().await?;

    let exercise: Option<ExerciseRow> =
        sqlx::query_as("SELECT * FROM exercises WHERE id = $1 FOR UPDATE")
            .bind(exercise_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(exercise) = exercise else {
        return Err(ApiError::exercise_not_found(exercise_id));
    };

    if exercise.started_at.is_some() {
        tx.commit().await?;
        return Ok(Json(exercise));
    }

    let exercise: ExerciseRow = sqlx::query_as(
        r#"
        UPDATE exercises
        SET started_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(exercise_id)
    .fetch_one(&mut *tx)
    .await?;

    let admitted = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'pending'
        WHERE status = 'queued'
          AND id IN (
            SELECT server_task_id FROM tests WHERE exercise_id = $1 AND server_task_id IS NOT NULL
            UNION
            SELECT client_task_id FROM tests WHERE exercise_id = $1 AND client_task_id IS NOT NULL
          )
        "#,
    )
    .bind(exercise_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    tracing::info!(
        event = "manager.exercise.started",
        exercise_id,
        admitted,
        "exercise started"
    );
    Ok(Json(exercise))
}

#[derive(Debug, Serialize)]
pub struct StopExerciseResponse {
    pub stopped: bool,
    pub kill_tasks: Vec<TaskRow>,
}

/// Stop is idempotent: an already-ended exercise emits no further kill_all
/// tasks.
async fn stop_exercise(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(exercise_id): Path<i64>,
) -> ApiResult<Json<StopExerciseResponse>> {
    let mut tx = state.pool.begin().await?;

    let exercise: Option<ExerciseRow> =
        sqlx::query_as("SELECT * FROM exercises WHERE id = $1 FOR UPDATE")
            .bind(exercise_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(exercise) = exercise else {
        return Err(ApiError::exercise_not_found(exercise_id));
    };

    if exercise.ended_at.is_some() {
        tx.commit().await?;
        return Ok(Json(StopExerciseResponse {
            stopped: true,
            kill_tasks: Vec::new(),
        }));
    }

    let kill_tasks: Vec<TaskRow> = sqlx::query_as(
        r#"
        INSERT INTO tasks (type, agent_id, status, payload)
        SELECT 'kill_all', involved.agent_id, 'pending', '{}'::jsonb
        FROM (
            SELECT server_agent_id AS agent_id FROM tests WHERE exercise_id = $1
            UNION
            SELECT client_agent_id FROM tests WHERE exercise_id = $1
        ) involved
        RETURNING *
        "#,
    )
    .bind(exercise_id)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE port_reservations
        SET released_at = now()
        WHERE released_at IS NULL
          AND task_id IN (
            SELECT server_task_id FROM tests
            WHERE exercise_id = $1 AND server_task_id IS NOT NULL
          )
        "#,
    )
    .bind(exercise_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE exercises SET ended_at = now() WHERE id = $1")
        .bind(exercise_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(
        event = "manager.exercise.stopped",
        exercise_id,
        kill_tasks = kill_tasks.len(),
        "exercise stopped"
    );
    Ok(Json(StopExerciseResponse {
        stopped: true,
        kill_tasks,
    }))
}

#[derive(Debug, Serialize)]
pub struct TestResult {
    pub test_id: i64,
    pub server: Value,
    pub client: Value,
    pub udp: bool,
    pub parallel: i32,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ClientMetrics>,
}

#[derive(Debug, Serialize)]
pub struct ExerciseResults {
    pub exercise_id: i64,
    pub tests: Vec<TestResult>,
    pub aggregate: Value,
}

async fn exercise_results(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(exercise_id): Path<i64>,
) -> ApiResult<Json<ExerciseResults>> {
    fetch_exercise(&state, exercise_id).await?;
    let tests = fetch_tests(&state, exercise_id).await?;

    let mut results = Vec::with_capacity(tests.len());
    for test in tests {
        let mut entry = TestResult {
            test_id: test.id,
            server: json!({"agent_id": test.server_agent_id, "port": test.server_port}),
            client: json!({"agent_id": test.client_agent_id}),
            udp: test.udp,
            parallel: test.parallel,
            status: "pending".to_string(),
            started_at: None,
            finished_at: None,
            metrics: None,
        };

        if let Some(client_task_id) = test.client_task_id {
            let task: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
                .bind(client_task_id)
                .fetch_optional(&state.pool)
                .await?;

            if let Some(task) = task {
                entry.status = task.status.clone();
                entry.started_at = task.started_at;
                entry.finished_at = task.finished_at;

                if task.status == "succeeded" {
                    if let Some(report) = &task.result {
                        entry.metrics = client_metrics(report);
                    }
                }
            }
        }

        results.push(entry);
    }

    let aggregate = aggregate_bps(&results);

    Ok(Json(ExerciseResults {
        exercise_id,
        tests: results,
        aggregate,
    }))
}

/// Aggregate throughput is the arithmetic mean over successful tests with
/// metrics; an exercise with no successes aggregates to `{}`.
fn aggregate_bps(results: &[TestResult]) -> Value {
    let successful: Vec<f64> = results
        .iter()
        .filter(|r| r.status == "succeeded")
        .filter_map(|r| r.metrics.as_ref().map(|m| m.bps_avg))
        .collect();

    if successful.is_empty() {
        return json!({});
    }

    let avg = successful.iter().sum::<f64>() / successful.len() as f64;
    json!({"bps_avg": avg})
}

async fn fetch_exercise(state: &AppState, exercise_id: i64) -> Result<ExerciseRow, ApiError> {
    sqlx::query_as("SELECT * FROM exercises WHERE id = $1")
        .bind(exercise_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::exercise_not_found(exercise_id))
}

async fn fetch_tests(state: &AppState, exercise_id: i64) -> Result<Vec<TestRow>, ApiError> {
    Ok(
        sqlx::query_as("SELECT * FROM tests WHERE exercise_id = $1 ORDER BY id")
            .bind(exercise_id)
            .fetch_all(&state.pool)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(status: &str, bps: Option<f64>) -> TestResult {
        TestResult {
            test_id: 1,
            server: json!({}),
            client: json!({}),
            udp: false,
            parallel: 1,
            status: status.to_string(),
            started_at: None,
            finished_at: None,
            metrics: bps.map(|bps_avg| ClientMetrics {
                bps_avg,
                retransmits: 0,
                jitter_ms: None,
                loss_pct: None,
            }),
        }
    }

    #[test]
    fn aggregate_is_mean_of_successful_tests() {
        let results = vec![
            result_with("succeeded", Some(2e9)),
            result_with("succeeded", Some(4e9)),
            result_with("failed", Some(9e9)),
            result_with("succeeded", None),
        ];
        assert_eq!(aggregate_bps(&results), json!({"bps_avg": 3e9}));
    }

    #[test]
    fn aggregate_is_empty_without_successes() {
        let results = vec![result_with("failed", None), result_with("timed_out", None)];
        assert_eq!(aggregate_bps(&results), json!({}));
    }
}
