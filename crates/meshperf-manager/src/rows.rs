//! Row types read back from the store.
//!
//! These double as response bodies: the serialized shape is the wire shape,
//! so secrets must be explicitly skipped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AgentRow {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub registration_key: String,
    pub status: String,
    pub disabled: bool,
    pub first_registered: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub operating_system: Option<String>,
}

impl AgentRow {
    /// Overwrite the stored status with one derived from heartbeat age.
    /// The stored column lags behind by up to one offline-marker period.
    pub fn derive_status(&mut self, now: DateTime<Utc>, liveness_window_secs: i64) {
        let online = self
            .last_heartbeat
            .is_some_and(|hb| now - hb <= Duration::seconds(liveness_window_secs));
        self.status = if online { "online" } else { "offline" }.to_string();
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExerciseRow {
    pub id: i64,
    pub name: String,
    pub duration_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TestRow {
    pub id: i64,
    pub exercise_id: i64,
    pub server_agent_id: i64,
    pub client_agent_id: i64,
    pub server_port: i32,
    pub udp: bool,
    pub parallel: i32,
    pub time_seconds: Option<i64>,
    pub server_task_id: Option<i64>,
    pub client_task_id: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub r#type: String,
    pub agent_id: i64,
    pub status: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReservationRow {
    pub id: i64,
    pub agent_id: i64,
    pub port: i32,
    pub task_id: i64,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(last_heartbeat: Option<DateTime<Utc>>) -> AgentRow {
        AgentRow {
            id: 1,
            name: "a1".into(),
            registration_key: "k".into(),
            status: "online".into(),
            disabled: false,
            first_registered: Utc::now(),
            last_heartbeat,
            ip_address: None,
            operating_system: None,
        }
    }

    #[test]
    fn registration_key_never_serializes() {
        let value = serde_json::to_value(agent(None)).unwrap();
        assert!(value.get("registration_key").is_none());
        assert_eq!(value["name"], "a1");
    }

    #[test]
    fn status_derives_from_heartbeat_age() {
        let now = Utc::now();

        let mut fresh = agent(Some(now - Duration::seconds(5)));
        fresh.derive_status(now, 15);
        assert_eq!(fresh.status, "online");

        let mut stale = agent(Some(now - Duration::seconds(30)));
        stale.derive_status(now, 15);
        assert_eq!(stale.status, "offline");

        let mut never = agent(None);
        never.status = "online".into();
        never.derive_status(now, 15);
        assert_eq!(never.status, "offline");
    }
}
