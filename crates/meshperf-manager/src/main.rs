use anyhow::Context;
use clap::Parser;
use meshperf_manager::{ManagerConfig, ManagerServer};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meshperf_manager=debug")),
        )
        .init();

    let cfg = ManagerConfig::parse();
    let bind: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("parse MANAGER_BIND={}", cfg.bind))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    let server = ManagerServer::start(pool, cfg, bind, true).await?;
    tracing::info!(addr = %server.addr, "manager listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("manager shutting down");
    server.shutdown().await?;
    Ok(())
}
