//! Wire types for the agent protocol.
//!
//! The Manager serves these under `/v1/agent/...`; the agent's
//! `ManagerClient` is the only other producer/consumer.

use crate::task::{TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AGENT_NAME_HEADER: &str = "X-AGENT-NAME";
pub const AGENT_KEY_HEADER: &str = "X-AGENT-KEY";
pub const API_VERSION_HEADER: &str = "X-API-Version";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub ip_address: String,
    #[serde(default)]
    pub operating_system: Option<String>,
}

/// One entry of the running-process snapshot an agent reports on heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcessInfo {
    pub r#type: String,
    pub port: Option<u16>,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub ip_address: String,
    #[serde(default)]
    pub running: Vec<RunningProcessInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub pull_tasks: bool,
}

/// A task as it travels from Manager to agent on claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWire {
    pub id: i64,
    pub r#type: TaskType,
    pub agent_id: i64,
    pub status: TaskStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub task: Option<TaskWire>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStartedRequest {
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_response_with_null_task_decodes() {
        let resp: ClaimResponse = serde_json::from_str(r#"{"task": null}"#).unwrap();
        assert!(resp.task.is_none());
    }

    #[test]
    fn task_wire_decodes_manager_row_shape() {
        let resp: ClaimResponse = serde_json::from_value(serde_json::json!({
            "task": {
                "id": 7,
                "type": "iperf_client_run",
                "agent_id": 2,
                "status": "accepted",
                "payload": {"server_ip": "10.0.0.1", "port": 5201},
                "result": null,
                "error": null,
                "created_at": "2025-01-01T00:00:00Z",
                "accepted_at": "2025-01-01T00:00:05Z",
                "started_at": null,
                "finished_at": null
            }
        }))
        .unwrap();
        let task = resp.task.unwrap();
        assert_eq!(task.r#type, TaskType::IperfClientRun);
        assert_eq!(task.status, TaskStatus::Accepted);
        assert!(task.started_at.is_none());
    }
}
