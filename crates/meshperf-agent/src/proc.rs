//! The running-processes table and subprocess stop helpers.
//!
//! The table is the only state shared between executors, the heartbeat
//! snapshot, kill_all, and shutdown. Whoever removes an entry owns its
//! `Child` and is responsible for reaping it.

use meshperf_core::protocol::RunningProcessInfo;
use std::{collections::HashMap, path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};
use tokio::{process::Child, sync::Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Server,
    Client,
}

impl ProcessKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Client => "client",
        }
    }
}

#[derive(Debug)]
pub struct RunningProcess {
    pub task_id: i64,
    pub kind: ProcessKind,
    pub port: Option<u16>,
    pub pid: u32,
    pub child: Child,
    pub output_file: Option<PathBuf>,
}

pub type ProcessTable = Arc<Mutex<HashMap<i64, RunningProcess>>>;

pub fn new_table() -> ProcessTable {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Snapshot for the heartbeat payload.
pub async fn snapshot(table: &ProcessTable) -> Vec<RunningProcessInfo> {
    table
        .lock()
        .await
        .values()
        .map(|proc| RunningProcessInfo {
            r#type: proc.kind.as_str().to_string(),
            port: proc.port,
            pid: proc.pid,
        })
        .collect()
}

/// Ask a process to terminate (SIGTERM via `kill`); best-effort.
pub async fn terminate_pid(pid: u32) {
    let _ = tokio::process::Command::new("kill")
        .arg(pid.to_string())
        .output()
        .await;
}

/// Wait for an already-terminated child within `grace`, force-killing on
/// timeout. Returns the exit status when the child could be reaped.
pub async fn wait_or_kill(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(_)) => None,
        Err(_) => {
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

/// Best-effort SIGKILL of iperf3 processes left over from a previous agent
/// run; the process table did not survive the restart, so the host process
/// list is the only record.
pub async fn kill_orphaned_iperf() {
    let output = match tokio::process::Command::new("pgrep")
        .args(["-f", "iperf3"])
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            tracing::debug!(error = %err, "pgrep unavailable, skipping orphan cleanup");
            return;
        }
    };

    if !output.status.success() {
        return;
    }

    let mut killed = 0;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<u32>() else {
            continue;
        };
        let _ = tokio::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .output()
            .await;
        killed += 1;
    }

    if killed > 0 {
        tracing::info!(
            event = "agent.orphans.killed",
            killed,
            "cleaned up orphaned iperf3 processes"
        );
    }
}
