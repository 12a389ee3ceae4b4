use axum::{http::StatusCode, response::IntoResponse, Json};
use meshperf_core::ErrorKind;
use serde_json::{json, Value};

pub type ApiResult<T> = Result<T, ApiError>;

/// Handler-level error carrying the wire envelope `{error, message, details}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn missing_agent_headers() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::MissingAgentHeaders,
            "X-AGENT-NAME and X-AGENT-KEY headers are required",
        )
    }

    pub fn invalid_agent_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::InvalidAgentKey,
            "Invalid agent registration key",
        )
    }

    /// The agent-protocol fatal signal: a 404 here tells the agent to exit.
    pub fn agent_must_exit() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::AgentNotFound,
            "Agent not found - agent must exit",
        )
    }

    pub fn agent_not_found(agent_id: i64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::AgentNotFound,
            "Agent not found",
        )
        .with_details(json!({"agent_id": agent_id}))
    }

    pub fn duplicate_agent_name(name: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorKind::DuplicateAgentName,
            "Agent with this name already exists",
        )
        .with_details(json!({"name": name}))
    }

    pub fn duplicate_exercise_name(name: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorKind::DuplicateExerciseName,
            "Exercise with this name already exists",
        )
        .with_details(json!({"name": name}))
    }

    pub fn exercise_not_found(exercise_id: i64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::ExerciseNotFound,
            "Exercise not found",
        )
        .with_details(json!({"exercise_id": exercise_id}))
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::TaskNotFound,
            "Task not found",
        )
        .with_details(json!({"task_id": task_id}))
    }

    /// Agent-protocol variant: wrong agent or unknown id is a 400, not the
    /// fatal 404.
    pub fn task_not_assigned(task_id: i64) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::TaskNotFound,
            "Task not found or not assigned to this agent",
        )
        .with_details(json!({"task_id": task_id}))
    }

    pub fn invalid_task_state(current: &str, expected: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidTaskState,
            format!("Task must be in {expected} state"),
        )
        .with_details(json!({"current_status": current}))
    }

    pub fn task_already_terminal(current: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorKind::TaskAlreadyTerminal,
            "Task is already in terminal state",
        )
        .with_details(json!({"current_status": current}))
    }

    pub fn port_reservation_conflict(agent_id: i64, port: i32) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorKind::PortReservationConflict,
            "Port already reserved for this agent",
        )
        .with_details(json!({"agent_id": agent_id, "port": port}))
    }

    pub fn missing_version_header(required: i32) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::MissingVersionHeader,
            "X-API-Version header is required",
        )
        .with_details(json!({"required_version": required}))
    }

    pub fn unsupported_version(server: i32) -> Self {
        Self::new(
            StatusCode::UPGRADE_REQUIRED,
            ErrorKind::UnsupportedVersion,
            "Unsupported API version",
        )
        .with_details(json!({"min": server, "max": server}))
    }

    pub fn invalid_version_format(provided: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidVersionFormat,
            "X-API-Version must be a number",
        )
        .with_details(json!({"provided": provided}))
    }

    pub fn claim_failed<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(event = "manager.claim.failed", error = %err, "task claim failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ClaimFailed,
            "Failed to claim task",
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Unauthorized, message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(event = "manager.internal_error", error = %err, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalError,
            "internal error",
        )
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "error": self.kind.as_str(),
            "message": self.message,
            "details": self.details,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_and_details() {
        let err = ApiError::port_reservation_conflict(3, 5201);
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.kind.as_str(), "port_reservation_conflict");
        assert_eq!(err.details["port"], 5201);
    }

    #[test]
    fn version_mismatch_reports_window() {
        let err = ApiError::unsupported_version(1);
        assert_eq!(err.status, StatusCode::UPGRADE_REQUIRED);
        assert_eq!(err.details["min"], 1);
        assert_eq!(err.details["max"], 1);
    }

    #[test]
    fn fatal_signal_is_a_404_agent_not_found() {
        let err = ApiError::agent_must_exit();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.kind.as_str(), "agent_not_found");
    }
}
