//! Typed client for the Manager's agent protocol.
//!
//! Every failure is classified: `Fatal` is the must-exit signal (HTTP 404
//! on any agent-protocol endpoint), everything else is `Transient` and the
//! caller retries on its next tick.

use crate::config::AgentConfig;
use anyhow::{anyhow, Context};
use meshperf_core::{
    protocol::{
        ClaimResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RunningProcessInfo,
        TaskResultRequest, TaskStartedRequest, TaskWire, AGENT_KEY_HEADER, AGENT_NAME_HEADER,
        API_VERSION_HEADER, IDEMPOTENCY_KEY_HEADER,
    },
    ErrorBody, TaskStatus,
};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    /// The Manager told us to exit (agent row gone or disabled).
    Fatal,
    /// Anything else: network error, 5xx, non-fatal 4xx. Retry next tick.
    Transient,
}

#[derive(Debug)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub error: anyhow::Error,
}

impl CallError {
    fn fatal(error: anyhow::Error) -> Self {
        Self {
            kind: CallErrorKind::Fatal,
            error,
        }
    }

    fn transient(error: anyhow::Error) -> Self {
        Self {
            kind: CallErrorKind::Transient,
            error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == CallErrorKind::Fatal
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

pub type CallResult<T> = Result<T, CallError>;

#[derive(Debug, Clone)]
pub struct ManagerClient {
    base_url: String,
    agent_name: String,
    agent_key: String,
    api_version: i32,
    http: reqwest::Client,
}

impl ManagerClient {
    pub fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url: cfg.manager_url.clone(),
            agent_name: cfg.agent_name.clone(),
            agent_key: cfg.agent_key.clone(),
            api_version: cfg.api_version,
            http,
        })
    }

    pub async fn register(&self, ip_address: &str, operating_system: &str) -> CallResult<()> {
        let req = RegisterRequest {
            ip_address: ip_address.to_string(),
            operating_system: Some(operating_system.to_string()),
        };
        self.post::<_, Value>("/v1/agent/register", &req, true)
            .await?;
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        ip_address: &str,
        running: Vec<RunningProcessInfo>,
    ) -> CallResult<bool> {
        let req = HeartbeatRequest {
            ip_address: ip_address.to_string(),
            running,
        };
        let resp: HeartbeatResponse = self.post("/v1/agent/heartbeat", &req, true).await?;
        Ok(resp.pull_tasks)
    }

    pub async fn claim_task(&self) -> CallResult<Option<TaskWire>> {
        let resp: ClaimResponse = self
            .post("/v1/agent/tasks/claim", &serde_json::json!({}), false)
            .await?;
        Ok(resp.task)
    }

    pub async fn mark_started(&self, task_id: i64, pid: Option<u32>) -> CallResult<()> {
        let req = TaskStartedRequest { pid };
        self.post::<_, Value>(&format!("/v1/agent/tasks/{task_id}/started"), &req, true)
            .await?;
        Ok(())
    }

    pub async fn submit_result(
        &self,
        task_id: i64,
        status: TaskStatus,
        result: Option<Value>,
        stderr: String,
        exit_code: i32,
    ) -> CallResult<()> {
        let req = TaskResultRequest {
            status,
            result,
            stderr,
            exit_code,
        };
        self.post::<_, Value>(&format!("/v1/agent/tasks/{task_id}/result"), &req, true)
            .await?;
        Ok(())
    }

    async fn post<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        idempotent: bool,
    ) -> CallResult<T> {
        let url = self.url(path).map_err(CallError::transient)?;

        let mut request = self
            .http
            .post(url)
            .header(AGENT_NAME_HEADER, &self.agent_name)
            .header(AGENT_KEY_HEADER, &self.agent_key)
            .header(API_VERSION_HEADER, self.api_version.to_string())
            .json(body);

        if idempotent {
            request = request.header(IDEMPOTENCY_KEY_HEADER, Uuid::new_v4().to_string());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {path}"))
            .map_err(CallError::transient)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let message = error_message(response).await;
            return Err(CallError::fatal(anyhow!(
                "manager says agent must exit: {message}"
            )));
        }

        if !status.is_success() {
            let message = error_message(response).await;
            return Err(CallError::transient(anyhow!(
                "POST {path} failed with {status}: {message}"
            )));
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("decode {path} response"))
            .map_err(CallError::transient)
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        let base = Url::parse(&self.base_url).context("parse manager base URL")?;
        base.join(path).context("join manager URL")
    }
}

async fn error_message(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) => match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => format!("{} ({})", body.message, body.error),
            Err(_) => text,
        },
        Err(_) => "<unreadable body>".to_string(),
    }
}
