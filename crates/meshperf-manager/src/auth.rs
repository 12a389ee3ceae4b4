//! Admin bearer-token auth (HS256).

use crate::{error::ApiError, AppState};
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
}

pub fn create_access_token(
    secret: &str,
    username: &str,
    ttl_minutes: i64,
) -> anyhow::Result<String> {
    let now = chrono::Utc::now();
    let iat: usize = now.timestamp().try_into().unwrap_or(0);
    let exp: usize = (now + chrono::Duration::minutes(ttl_minutes))
        .timestamp()
        .try_into()
        .unwrap_or(usize::MAX);

    let claims = AdminClaims {
        sub: username.to_string(),
        iat,
        exp,
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn verify_access_token(secret: &str, token: &str) -> anyhow::Result<AdminClaims> {
    let data = decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Extractor that gates admin endpoints on a valid bearer token.
#[derive(Debug)]
pub struct AdminUser(pub String);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

        let claims = verify_access_token(&state.cfg.jwt_secret, token).map_err(|err| {
            tracing::info!(event = "manager.auth.rejected", error = %err, "bearer token rejected");
            ApiError::unauthorized("invalid bearer token")
        })?;

        Ok(AdminUser(claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let token = create_access_token("secret", "admin", 30).unwrap();
        let claims = verify_access_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_access_token("secret", "admin", 30).unwrap();
        assert!(verify_access_token("other", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = create_access_token("secret", "admin", -5).unwrap();
        assert!(verify_access_token("secret", &token).is_err());
    }
}
