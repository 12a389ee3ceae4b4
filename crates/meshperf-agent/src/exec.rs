//! Task executors: iperf3 server start, client run with retry, kill_all.

use crate::{
    capture,
    client::ManagerClient,
    paths::AgentPaths,
    proc::{self, ProcessKind, ProcessTable, RunningProcess},
};
use anyhow::Context;
use meshperf_core::{
    protocol::TaskWire, ClientPayload, ServerPayload, TaskStatus, TaskType,
};
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, process::Command};

const KILL_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);
const CAPTURE_BUDGET: Duration = Duration::from_secs(10);

/// iperf3 argv for a server task (after the binary name).
pub fn server_args(payload: &ServerPayload) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        "-p".to_string(),
        payload.port.to_string(),
        "-J".to_string(),
    ];
    if payload.udp {
        args.push("-u".to_string());
    }
    args
}

/// iperf3 argv for a client task (after the binary name).
pub fn client_args(payload: &ClientPayload) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        payload.server_ip.clone(),
        "-p".to_string(),
        payload.port.to_string(),
        "-P".to_string(),
        payload.parallel.to_string(),
        "-t".to_string(),
        payload.time.to_string(),
        "-J".to_string(),
    ];
    if payload.udp {
        args.extend(["-u".to_string(), "-b".to_string(), "0".to_string()]);
    }
    args
}

/// Connection-phase failures are worth retrying; everything else is not.
pub fn is_connection_failure(output: &str) -> bool {
    output.contains("Connection refused")
        || output.contains("No route to host")
        || output.to_lowercase().contains("unable to connect")
}

/// Exponential backoff before retry attempt N (N >= 2):
/// `retry_delay * 2^(attempt - 2)` seconds.
pub fn retry_backoff(retry_delay_seconds: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2).min(16);
    Duration::from_secs(retry_delay_seconds.saturating_mul(1u64 << exponent))
}

/// Entry point for a claimed task; dispatches on type and guarantees a
/// result submission on every path it controls.
pub async fn run_task(
    client: Arc<ManagerClient>,
    table: ProcessTable,
    paths: AgentPaths,
    task: TaskWire,
) {
    let task_id = task.id;
    let outcome = match task.r#type {
        TaskType::IperfServerStart => run_server_task(&client, &table, &paths, &task).await,
        TaskType::IperfClientRun => run_client_task(&client, &table, &paths, &task).await,
        TaskType::KillAll => run_kill_all(&client, &table, &paths, task_id).await,
    };

    if let Err(err) = outcome {
        tracing::error!(
            event = "agent.task.error",
            task_id,
            error = %format!("{err:#}"),
            "task execution failed"
        );
        if let Err(submit_err) = client
            .submit_result(
                task_id,
                TaskStatus::Failed,
                None,
                format!("{err:#}"),
                1,
            )
            .await
        {
            tracing::warn!(
                event = "agent.task.submit_failed",
                task_id,
                error = %submit_err,
                "could not report task failure"
            );
        }
    }
}

/// Spawn `iperf3 -s`, record it in the table, and report success as soon as
/// the process is alive. The report is harvested by the kill pathway.
async fn run_server_task(
    client: &Arc<ManagerClient>,
    table: &ProcessTable,
    paths: &AgentPaths,
    task: &TaskWire,
) -> anyhow::Result<()> {
    let payload: ServerPayload =
        serde_json::from_value(task.payload.clone()).context("decode server payload")?;

    let output_file = paths.temp_server_file(task.id);
    let stdout = std::fs::File::create(&output_file)
        .with_context(|| format!("create {}", output_file.display()))?;

    let child = Command::new("iperf3")
        .args(server_args(&payload))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::null())
        .spawn()
        .context("spawn iperf3 server")?;
    let pid = child.id().unwrap_or_default();

    table.lock().await.insert(
        task.id,
        RunningProcess {
            task_id: task.id,
            kind: ProcessKind::Server,
            port: Some(payload.port),
            pid,
            child,
            output_file: Some(output_file.clone()),
        },
    );

    if let Err(err) = client.mark_started(task.id, Some(pid)).await {
        tracing::warn!(
            event = "agent.server.mark_started_failed",
            task_id = task.id,
            error = %err,
            "could not mark server task started"
        );
    }

    tracing::info!(
        event = "agent.server.started",
        task_id = task.id,
        pid,
        port = payload.port,
        output_file = %output_file.display(),
        "server task started"
    );

    client
        .submit_result(
            task.id,
            TaskStatus::Succeeded,
            Some(serde_json::json!({"started": true, "pid": pid})),
            String::new(),
            0,
        )
        .await
        .map_err(|err| anyhow::anyhow!("submit server start result: {err}"))?;

    Ok(())
}

/// Run `iperf3 -c` with an initial startup delay and connection-phase
/// retries with exponential backoff.
async fn run_client_task(
    client: &Arc<ManagerClient>,
    table: &ProcessTable,
    paths: &AgentPaths,
    task: &TaskWire,
) -> anyhow::Result<()> {
    let payload: ClientPayload =
        serde_json::from_value(task.payload.clone()).context("decode client payload")?;

    let max_attempts = payload.max_retries.max(1);

    for attempt in 1..=max_attempts {
        if attempt == 1 {
            if payload.client_delay_seconds > 0 {
                tracing::info!(
                    event = "agent.client.delay",
                    task_id = task.id,
                    delay = payload.client_delay_seconds,
                    "waiting for server startup"
                );
                tokio::time::sleep(Duration::from_secs(payload.client_delay_seconds)).await;
            }
        } else {
            let backoff = retry_backoff(payload.retry_delay_seconds, attempt);
            tracing::info!(
                event = "agent.client.retry",
                task_id = task.id,
                attempt,
                backoff_secs = backoff.as_secs(),
                "retrying after connection failure"
            );
            tokio::time::sleep(backoff).await;
        }

        let spawned = Command::new("iperf3")
            .args(client_args(&payload))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) if attempt < max_attempts => {
                tracing::warn!(
                    event = "agent.client.spawn_failed",
                    task_id = task.id,
                    attempt,
                    error = %err,
                    "spawn failed, will retry"
                );
                continue;
            }
            Err(err) => return Err(err).context("spawn iperf3 client"),
        };

        let pid = child.id().unwrap_or_default();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        table.lock().await.insert(
            task.id,
            RunningProcess {
                task_id: task.id,
                kind: ProcessKind::Client,
                port: Some(payload.port),
                pid,
                child,
                output_file: None,
            },
        );

        if attempt == 1 {
            if let Err(err) = client.mark_started(task.id, Some(pid)).await {
                tracing::warn!(
                    event = "agent.client.mark_started_failed",
                    task_id = task.id,
                    error = %err,
                    "could not mark client task started"
                );
            }
        }

        tracing::info!(
            event = "agent.client.started",
            task_id = task.id,
            attempt,
            pid,
            server = %payload.server_ip,
            port = payload.port,
            "client attempt started"
        );

        // Pipe EOF doubles as process exit; the table entry keeps the child
        // reachable for kill_all in the meantime.
        let (stdout, stderr) = tokio::join!(read_pipe(stdout_pipe), read_pipe(stderr_pipe));

        let reaped = table.lock().await.remove(&task.id);
        let status = match reaped {
            Some(mut entry) => Some(entry.child.wait().await.context("wait iperf3 client")?),
            // kill_all or shutdown already took and reaped the child.
            None => None,
        };

        match status {
            Some(status) if status.success() => {
                let report: serde_json::Value = match serde_json::from_str(&stdout) {
                    Ok(report) => report,
                    Err(err) => {
                        // Bad JSON from a zero exit is not retryable.
                        tracing::error!(
                            event = "agent.client.bad_json",
                            task_id = task.id,
                            error = %err,
                            "iperf3 produced unparseable output"
                        );
                        return submit(client, task.id, TaskStatus::Failed, None, "Invalid JSON output".to_string(), 1)
                            .await;
                    }
                };

                let result_file = paths.result_file(task.id, false);
                if let Err(err) = tokio::fs::write(
                    &result_file,
                    serde_json::to_vec_pretty(&report).context("encode client report")?,
                )
                .await
                {
                    tracing::warn!(
                        event = "agent.client.persist_failed",
                        task_id = task.id,
                        error = %err,
                        "could not persist client report"
                    );
                }

                tracing::info!(
                    event = "agent.client.succeeded",
                    task_id = task.id,
                    attempt,
                    result_file = %result_file.display(),
                    "client task completed"
                );
                return submit(client, task.id, TaskStatus::Succeeded, Some(report), stderr, 0).await;
            }
            Some(status) => {
                let combined = if !stderr.trim().is_empty() {
                    stderr.clone()
                } else {
                    stdout.clone()
                };
                let exit_code = status.code().unwrap_or(-1);

                if is_connection_failure(&combined) && attempt < max_attempts {
                    tracing::warn!(
                        event = "agent.client.connect_failed",
                        task_id = task.id,
                        attempt,
                        exit_code,
                        "connection failed, will retry"
                    );
                    continue;
                }

                tracing::error!(
                    event = "agent.client.failed",
                    task_id = task.id,
                    attempt,
                    exit_code,
                    "client task failed"
                );
                let error = if combined.trim().is_empty() {
                    format!("Exit code {exit_code}")
                } else {
                    combined
                };
                return submit(client, task.id, TaskStatus::Failed, None, error, exit_code).await;
            }
            None => {
                tracing::warn!(
                    event = "agent.client.killed",
                    task_id = task.id,
                    "client process was killed externally"
                );
                let error = if stderr.trim().is_empty() {
                    "terminated".to_string()
                } else {
                    stderr
                };
                return submit(client, task.id, TaskStatus::Failed, None, error, -1).await;
            }
        }
    }

    Ok(())
}

/// Terminate everything in the table. Server children get their stdout
/// harvested; the whole capture phase shares one time budget so a wedged
/// capture cannot stall the kill.
pub async fn kill_running_processes(
    client: &Arc<ManagerClient>,
    paths: &AgentPaths,
    table: &ProcessTable,
) -> usize {
    let entries: Vec<RunningProcess> = {
        let mut table = table.lock().await;
        table.drain().map(|(_, entry)| entry).collect()
    };

    let mut killed = 0;
    let mut captures = Vec::new();

    for mut entry in entries {
        proc::terminate_pid(entry.pid).await;
        killed += 1;

        tracing::info!(
            event = "agent.kill.process",
            task_id = entry.task_id,
            pid = entry.pid,
            kind = entry.kind.as_str(),
            "terminating child process"
        );

        match entry.kind {
            ProcessKind::Server => {
                let client = client.clone();
                let paths = paths.clone();
                captures.push(async move {
                    let _ = proc::wait_or_kill(&mut entry.child, SHUTDOWN_WAIT).await;
                    if let Some(output_file) = entry.output_file.clone() {
                        if let Err(err) =
                            capture::capture_server_result(&client, &paths, entry.task_id, &output_file)
                                .await
                        {
                            tracing::warn!(
                                event = "agent.capture.failed",
                                task_id = entry.task_id,
                                error = %format!("{err:#}"),
                                "server result capture failed"
                            );
                        }
                    }
                });
            }
            ProcessKind::Client => {
                proc::wait_or_kill(&mut entry.child, KILL_WAIT).await;
            }
        }
    }

    if !captures.is_empty() {
        let pending = captures.len();
        if tokio::time::timeout(CAPTURE_BUDGET, futures_join_all(captures))
            .await
            .is_err()
        {
            tracing::warn!(
                event = "agent.capture.timeout",
                pending,
                "server result capture exceeded budget"
            );
        }
    }

    killed
}

// Sequential await is fine here: captures are short file reads + one POST
// each, and the overall budget caps the total.
async fn futures_join_all(futures: Vec<impl std::future::Future<Output = ()>>) {
    for future in futures {
        future.await;
    }
}

async fn run_kill_all(
    client: &Arc<ManagerClient>,
    table: &ProcessTable,
    paths: &AgentPaths,
    task_id: i64,
) -> anyhow::Result<()> {
    let killed = kill_running_processes(client, paths, table).await;

    tracing::info!(
        event = "agent.kill_all.done",
        task_id,
        killed,
        "kill_all completed"
    );

    submit(
        client,
        task_id,
        TaskStatus::Succeeded,
        Some(serde_json::json!({"killed": true, "count": killed})),
        String::new(),
        0,
    )
    .await
}

async fn submit(
    client: &Arc<ManagerClient>,
    task_id: i64,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    stderr: String,
    exit_code: i32,
) -> anyhow::Result<()> {
    client
        .submit_result(task_id, status, result, stderr, exit_code)
        .await
        .map_err(|err| anyhow::anyhow!("submit result for task {task_id}: {err}"))
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = pipe.read_to_string(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_payload() -> ClientPayload {
        serde_json::from_value(serde_json::json!({
            "server_ip": "10.0.0.1",
            "port": 5201,
            "parallel": 4,
            "time": 10
        }))
        .unwrap()
    }

    #[test]
    fn server_command_is_bit_exact() {
        let tcp: ServerPayload =
            serde_json::from_value(serde_json::json!({"port": 5201})).unwrap();
        assert_eq!(server_args(&tcp), ["-s", "-p", "5201", "-J"]);

        let udp: ServerPayload =
            serde_json::from_value(serde_json::json!({"port": 5999, "udp": true})).unwrap();
        assert_eq!(server_args(&udp), ["-s", "-p", "5999", "-J", "-u"]);
    }

    #[test]
    fn client_command_is_bit_exact() {
        let payload = client_payload();
        assert_eq!(
            client_args(&payload),
            ["-c", "10.0.0.1", "-p", "5201", "-P", "4", "-t", "10", "-J"]
        );

        let mut udp = client_payload();
        udp.udp = true;
        assert_eq!(
            client_args(&udp),
            ["-c", "10.0.0.1", "-p", "5201", "-P", "4", "-t", "10", "-J", "-u", "-b", "0"]
        );
    }

    #[test]
    fn connection_failures_are_retryable() {
        assert!(is_connection_failure("iperf3: error - unable to connect to server"));
        assert!(is_connection_failure("connect failed: Connection refused"));
        assert!(is_connection_failure("No route to host"));
        assert!(is_connection_failure("Unable To Connect"));
        assert!(!is_connection_failure("error - control socket has closed"));
        assert!(!is_connection_failure(""));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(retry_backoff(2, 2), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, 3), Duration::from_secs(4));
        assert_eq!(retry_backoff(2, 4), Duration::from_secs(8));
        assert_eq!(retry_backoff(5, 3), Duration::from_secs(10));
    }
}
