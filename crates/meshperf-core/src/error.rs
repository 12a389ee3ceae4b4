//! The error envelope shared by every Manager endpoint.
//!
//! The `error` field carries a stable machine-readable kind; `message` is
//! for humans; `details` is endpoint-specific context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingAgentHeaders,
    InvalidAgentKey,
    AgentNotFound,
    DuplicateAgentName,
    DuplicateExerciseName,
    ExerciseNotFound,
    TaskNotFound,
    InvalidTaskState,
    TaskAlreadyTerminal,
    PortReservationConflict,
    MissingVersionHeader,
    UnsupportedVersion,
    InvalidVersionFormat,
    ClaimFailed,
    ValidationError,
    Unauthorized,
    InternalError,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingAgentHeaders => "missing_agent_headers",
            ErrorKind::InvalidAgentKey => "invalid_agent_key",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::DuplicateAgentName => "duplicate_agent_name",
            ErrorKind::DuplicateExerciseName => "duplicate_exercise_name",
            ErrorKind::ExerciseNotFound => "exercise_not_found",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::InvalidTaskState => "invalid_task_state",
            ErrorKind::TaskAlreadyTerminal => "task_already_terminal",
            ErrorKind::PortReservationConflict => "port_reservation_conflict",
            ErrorKind::MissingVersionHeader => "missing_version_header",
            ErrorKind::UnsupportedVersion => "unsupported_version",
            ErrorKind::InvalidVersionFormat => "invalid_version_format",
            ErrorKind::ClaimFailed => "claim_failed",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope: `{error, message, details}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_to_stable_identifiers() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::PortReservationConflict).unwrap(),
            "\"port_reservation_conflict\""
        );
        assert_eq!(ErrorKind::AgentNotFound.as_str(), "agent_not_found");
        assert_eq!(ErrorKind::UnsupportedVersion.as_str(), "unsupported_version");
    }

    #[test]
    fn envelope_decodes_without_details() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"error": "agent_not_found", "message": "gone"}"#).unwrap();
        assert_eq!(body.error, "agent_not_found");
        assert!(body.details.is_null());
    }
}
