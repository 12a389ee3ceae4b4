use crate::{
    auth::create_access_token,
    error::{ApiError, ApiResult},
    AppState,
};
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/auth/login", post(login))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    if req.username != state.cfg.admin_username || req.password != state.cfg.admin_password {
        return Err(ApiError::unauthorized("incorrect username or password"));
    }

    let access_token = create_access_token(
        &state.cfg.jwt_secret,
        &req.username,
        state.cfg.access_token_ttl_minutes,
    )
    .map_err(ApiError::internal)?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}
