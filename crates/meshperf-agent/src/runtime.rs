//! The agent main loop: heartbeat, claim burst, executor supervision, and
//! graceful shutdown.

use crate::{
    client::ManagerClient,
    config::AgentConfig,
    exec,
    paths::AgentPaths,
    proc::{self, ProcessTable},
};
use std::{collections::HashMap, net::UdpSocket, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

const LOOP_PERIOD: Duration = Duration::from_secs(5);
const CLAIM_BURST: usize = 5;
const MAX_CONSECUTIVE_HEARTBEAT_FAILURES: u32 = 3;

pub struct Agent {
    cfg: AgentConfig,
    client: Arc<ManagerClient>,
    paths: AgentPaths,
    table: ProcessTable,
    running_tasks: HashMap<i64, JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: AgentConfig, client: Arc<ManagerClient>, paths: AgentPaths) -> Self {
        Self {
            cfg,
            client,
            paths,
            table: proc::new_table(),
            running_tasks: HashMap::new(),
        }
    }

    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            event = "agent.started",
            agent = %self.cfg.agent_name,
            "agent main loop running"
        );

        let mut consecutive_failures: u32 = 0;

        while !*shutdown_rx.borrow() {
            self.reap_finished();

            match self
                .client
                .heartbeat(&local_ip(), proc::snapshot(&self.table).await)
                .await
            {
                Err(err) if err.is_fatal() => {
                    tracing::error!(
                        event = "agent.heartbeat.fatal",
                        error = %err,
                        "manager sent the exit signal"
                    );
                    break;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_HEARTBEAT_FAILURES {
                        tracing::error!(
                            event = "agent.heartbeat.giving_up",
                            consecutive_failures,
                            error = %err,
                            "too many consecutive heartbeat failures"
                        );
                        break;
                    }
                    tracing::warn!(
                        event = "agent.heartbeat.failed",
                        consecutive_failures,
                        error = %err,
                        "heartbeat failed, will retry"
                    );
                }
                Ok(pull_tasks) => {
                    if consecutive_failures > 0 {
                        tracing::info!(
                            event = "agent.heartbeat.recovered",
                            previous_failures = consecutive_failures,
                            "heartbeat recovered"
                        );
                    }
                    consecutive_failures = 0;

                    if pull_tasks {
                        self.claim_burst().await;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(LOOP_PERIOD) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Claim up to the burst limit, spawning one executor per task. Stops
    /// at the first empty claim; a task already executing is never started
    /// a second time.
    async fn claim_burst(&mut self) {
        for _ in 0..CLAIM_BURST {
            let task = match self.client.claim_task().await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        event = "agent.claim.failed",
                        error = %err,
                        "task claim failed"
                    );
                    break;
                }
            };

            if self.running_tasks.contains_key(&task.id) {
                tracing::warn!(
                    event = "agent.claim.duplicate",
                    task_id = task.id,
                    "task already executing, skipping"
                );
                continue;
            }

            let task_id = task.id;
            tracing::info!(
                event = "agent.task.spawned",
                task_id,
                task_type = %task.r#type,
                total_running = self.running_tasks.len() + 1,
                "executing task in background"
            );

            let handle = tokio::spawn(exec::run_task(
                self.client.clone(),
                self.table.clone(),
                self.paths.clone(),
                task,
            ));
            self.running_tasks.insert(task_id, handle);
        }
    }

    fn reap_finished(&mut self) {
        self.running_tasks.retain(|_, handle| !handle.is_finished());
    }

    async fn shutdown(&mut self) {
        let running_processes = self.table.lock().await.len();
        tracing::info!(
            event = "agent.shutdown",
            running_processes,
            running_tasks = self.running_tasks.len(),
            "agent shutting down"
        );

        let killed = exec::kill_running_processes(&self.client, &self.paths, &self.table).await;
        if killed > 0 {
            tracing::info!(
                event = "agent.shutdown.killed",
                killed,
                "child processes stopped on shutdown"
            );
        }

        for (task_id, handle) in self.running_tasks.drain() {
            if let Err(err) = handle.await {
                tracing::warn!(
                    event = "agent.shutdown.join_failed",
                    task_id,
                    error = %err,
                    "executor task did not finish cleanly"
                );
            }
        }
    }
}

/// Local IP as seen on the default route; the UDP connect never sends a
/// packet. Falls back to loopback on airgapped hosts.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Flip the shutdown flag on SIGTERM or SIGINT.
pub fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::warn!(error = %err, "could not install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!(event = "agent.signal", signal = "SIGTERM", "shutdown signal received");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(event = "agent.signal", signal = "SIGINT", "shutdown signal received");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(event = "agent.signal", signal = "ctrl-c", "shutdown signal received");
        }

        let _ = shutdown_tx.send(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_is_always_some_address() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok(), "got {ip}");
    }
}
