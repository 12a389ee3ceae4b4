use anyhow::Context;
use clap::Parser;
use meshperf_agent::{
    client::ManagerClient,
    config::AgentConfig,
    paths::AgentPaths,
    proc,
    runtime::{local_ip, spawn_signal_listener, Agent},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // CLI flags override env vars, which override `.env`.
    let _ = dotenvy::dotenv();
    let cfg = AgentConfig::parse();

    let paths = AgentPaths::new(&cfg.agent_name).context("create agent directories")?;
    init_tracing(&paths)?;

    tracing::info!(
        event = "agent.boot",
        agent = %cfg.agent_name,
        manager = %cfg.manager_url,
        "starting agent"
    );

    match paths.clean_stale_temp() {
        Ok(removed) if removed > 0 => {
            tracing::info!(event = "agent.temp.cleaned", removed, "stale temp files removed");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "could not clean stale temp files");
        }
    }

    proc::kill_orphaned_iperf().await;

    let client = Arc::new(ManagerClient::new(&cfg).context("build manager client")?);

    if let Err(err) = client
        .register(&local_ip(), std::env::consts::OS)
        .await
    {
        anyhow::bail!("registration failed: {err}");
    }
    tracing::info!(event = "agent.registered", "registered with manager");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    Agent::new(cfg, client, paths).run(shutdown_rx).await
}

fn init_tracing(paths: &AgentPaths) -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())
        .context("open agent log file")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(log_file)),
        )
        .init();

    Ok(())
}
