//! The API version gate.
//!
//! A coarse integer-equality check applied to every endpoint except the
//! health probe and the login endpoint. Matching responses echo the served
//! version back in `X-API-Version`.

use crate::{error::ApiError, AppState};
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use meshperf_core::protocol::API_VERSION_HEADER;
use std::sync::Arc;

const EXEMPT_PATHS: [&str; 2] = ["/healthz", "/v1/auth/login"];

/// Pure check so the gate logic is unit-testable without a router.
pub fn check_version(header: Option<&str>, server_version: i32) -> Result<(), ApiError> {
    let Some(raw) = header else {
        return Err(ApiError::missing_version_header(server_version));
    };

    let version: i32 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::invalid_version_format(raw))?;

    if version != server_version {
        return Err(ApiError::unsupported_version(server_version));
    }

    Ok(())
}

pub async fn require_api_version(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if EXEMPT_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(API_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    check_version(header.as_deref(), state.cfg.api_version)?;

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&state.cfg.api_version.to_string()) {
        response.headers_mut().insert("x-api-version", value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn missing_header_is_bad_request() {
        let err = check_version(None, 1).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind.as_str(), "missing_version_header");
    }

    #[test]
    fn garbage_header_is_bad_request() {
        let err = check_version(Some("one"), 1).unwrap_err();
        assert_eq!(err.kind.as_str(), "invalid_version_format");
        assert_eq!(err.details["provided"], "one");
    }

    #[test]
    fn mismatch_is_upgrade_required() {
        let err = check_version(Some("2"), 1).unwrap_err();
        assert_eq!(err.status, StatusCode::UPGRADE_REQUIRED);
        assert_eq!(err.details["min"], 1);
    }

    #[test]
    fn exact_match_passes() {
        assert!(check_version(Some("1"), 1).is_ok());
        assert!(check_version(Some(" 1 "), 1).is_ok());
    }
}
