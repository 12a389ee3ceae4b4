//! Admin CRUD over agents.
//!
//! Agents are never hard-deleted; disabling is the only retirement path.
//! List/get responses carry a status derived from heartbeat age rather than
//! the stored column, which lags by up to one offline-marker period.

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    rows::AgentRow,
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/agents", post(create_agent).get(list_agents))
        .route("/v1/agents/:id", get(get_agent))
        .route("/v1/agents/:id", put(update_agent))
        .route("/v1/agents/:id/disable", post(disable_agent))
        .route("/v1/agents/:id/enable", post(enable_agent))
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub registration_key: String,
    #[serde(default)]
    pub operating_system: Option<String>,
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentRow>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("agent name must not be empty"));
    }

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM agents WHERE name = $1")
        .bind(&req.name)
        .fetch_optional(&state.pool)
        .await?;
    if existing.is_some() {
        return Err(ApiError::duplicate_agent_name(&req.name));
    }

    let agent: AgentRow = sqlx::query_as(
        r#"
        INSERT INTO agents (name, registration_key, operating_system, status)
        VALUES ($1, $2, $3, 'offline')
        RETURNING *
        "#,
    )
    .bind(&req.name)
    .bind(&req.registration_key)
    .bind(&req.operating_system)
    .fetch_one(&state.pool)
    .await
    .map_err(|err| map_duplicate_name(err, &req.name))?;

    tracing::info!(event = "manager.agent.created", agent = %agent.name, "agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Query(query): Query<ListAgentsQuery>,
) -> ApiResult<Json<Vec<AgentRow>>> {
    let mut agents: Vec<AgentRow> = sqlx::query_as(
        r#"
        SELECT * FROM agents
        WHERE ($1 OR NOT disabled)
        ORDER BY id
        "#,
    )
    .bind(query.include_disabled)
    .fetch_all(&state.pool)
    .await?;

    let now = Utc::now();
    for agent in &mut agents {
        agent.derive_status(now, state.cfg.agent_liveness_window_secs);
    }

    if let Some(status) = &query.status {
        agents.retain(|a| &a.status == status);
    }

    Ok(Json(agents))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<AgentRow>> {
    let mut agent = fetch_agent(&state, agent_id).await?;
    agent.derive_status(Utc::now(), state.cfg.agent_liveness_window_secs);
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub registration_key: Option<String>,
    #[serde(default)]
    pub operating_system: Option<String>,
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(agent_id): Path<i64>,
    Json(req): Json<UpdateAgentRequest>,
) -> ApiResult<Json<AgentRow>> {
    let agent = fetch_agent(&state, agent_id).await?;

    if let Some(name) = &req.name {
        if name != &agent.name {
            let taken: Option<(i64,)> = sqlx::query_as("SELECT id FROM agents WHERE name = $1")
                .bind(name)
                .fetch_optional(&state.pool)
                .await?;
            if taken.is_some() {
                return Err(ApiError::duplicate_agent_name(name));
            }
        }
    }

    let mut updated: AgentRow = sqlx::query_as(
        r#"
        UPDATE agents
        SET name = COALESCE($2, name),
            registration_key = COALESCE($3, registration_key),
            operating_system = COALESCE($4, operating_system)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(agent_id)
    .bind(&req.name)
    .bind(&req.registration_key)
    .bind(&req.operating_system)
    .fetch_one(&state.pool)
    .await
    .map_err(|err| map_duplicate_name(err, req.name.as_deref().unwrap_or(&agent.name)))?;

    updated.derive_status(Utc::now(), state.cfg.agent_liveness_window_secs);
    Ok(Json(updated))
}

async fn disable_agent(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(agent_id): Path<i64>,
) -> ApiResult<StatusCode> {
    set_disabled(&state, agent_id, true).await?;
    tracing::info!(event = "manager.agent.disabled", agent_id, "agent disabled");
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_agent(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(agent_id): Path<i64>,
) -> ApiResult<StatusCode> {
    set_disabled(&state, agent_id, false).await?;
    tracing::info!(event = "manager.agent.enabled", agent_id, "agent enabled");
    Ok(StatusCode::NO_CONTENT)
}

async fn set_disabled(state: &AppState, agent_id: i64, disabled: bool) -> Result<(), ApiError> {
    let result = sqlx::query("UPDATE agents SET disabled = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(disabled)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::agent_not_found(agent_id));
    }
    Ok(())
}

/// Two racing creates both pass the pre-check; the unique index settles it.
fn map_duplicate_name(err: sqlx::Error, name: &str) -> ApiError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return ApiError::duplicate_agent_name(name);
        }
    }
    ApiError::internal(err)
}

async fn fetch_agent(state: &AppState, agent_id: i64) -> Result<AgentRow, ApiError> {
    sqlx::query_as("SELECT * FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::agent_not_found(agent_id))
}
