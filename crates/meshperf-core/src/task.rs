use serde::{Deserialize, Serialize};
use std::fmt;

/// The three kinds of work an agent can be handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IperfServerStart,
    IperfClientRun,
    KillAll,
}

impl TaskType {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskType::IperfServerStart => "iperf_server_start",
            TaskType::IperfClientRun => "iperf_client_run",
            TaskType::KillAll => "kill_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "iperf_server_start" => Some(TaskType::IperfServerStart),
            "iperf_client_run" => Some(TaskType::IperfClientRun),
            "kill_all" => Some(TaskType::KillAll),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle: `queued → pending → accepted → running → terminal`.
///
/// `queued` means the owning exercise has not started yet; `pending` means
/// claimable. The four terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Pending,
    Accepted,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

/// Terminal statuses as they appear in SQL `IN (...)` lists.
pub const TERMINAL_STATUSES: [TaskStatus; 4] = [
    TaskStatus::Succeeded,
    TaskStatus::Failed,
    TaskStatus::Canceled,
    TaskStatus::TimedOut,
];

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Pending => "pending",
            TaskStatus::Accepted => "accepted",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "pending" => Some(TaskStatus::Pending),
            "accepted" => Some(TaskStatus::Accepted),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            "timed_out" => Some(TaskStatus::TimedOut),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::Canceled
                | TaskStatus::TimedOut
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for an `iperf_server_start` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPayload {
    pub port: u16,
    #[serde(default)]
    pub udp: bool,
}

fn default_parallel() -> u32 {
    1
}

fn default_time() -> u64 {
    30
}

fn default_client_delay() -> u64 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

/// Payload for an `iperf_client_run` task.
///
/// The Manager fills in every field at test creation; the defaults exist so
/// an agent can still run a payload written by an older manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPayload {
    pub server_ip: String,
    pub port: u16,
    #[serde(default)]
    pub udp: bool,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default = "default_time")]
    pub time: u64,
    #[serde(default = "default_client_delay")]
    pub client_delay_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_wire_names() {
        for t in [
            TaskType::IperfServerStart,
            TaskType::IperfClientRun,
            TaskType::KillAll,
        ] {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert_eq!(TaskType::parse("iperf_server_stop"), None);
    }

    #[test]
    fn terminal_statuses_are_absorbing_set() {
        for s in TERMINAL_STATUSES {
            assert!(s.is_terminal());
        }
        for s in [
            TaskStatus::Queued,
            TaskStatus::Pending,
            TaskStatus::Accepted,
            TaskStatus::Running,
        ] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn status_wire_names_match_store_values() {
        assert_eq!(TaskStatus::TimedOut.as_str(), "timed_out");
        assert_eq!(TaskStatus::parse("timed_out"), Some(TaskStatus::TimedOut));
        assert_eq!(
            serde_json::to_string(&TaskStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn client_payload_applies_defaults_for_absent_fields() {
        let payload: ClientPayload =
            serde_json::from_value(serde_json::json!({"server_ip": "10.0.0.1", "port": 5201}))
                .unwrap();
        assert_eq!(payload.parallel, 1);
        assert_eq!(payload.time, 30);
        assert_eq!(payload.client_delay_seconds, 3);
        assert_eq!(payload.max_retries, 3);
        assert_eq!(payload.retry_delay_seconds, 2);
        assert!(!payload.udp);
    }
}
