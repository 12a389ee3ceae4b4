//! meshperf Manager.
//!
//! Admin REST surface, the agent protocol, and the four background sweepers
//! over a shared Postgres store.

use anyhow::Context;
use axum::{middleware, routing::get, Json, Router};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub mod auth;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod routes;
pub mod rows;
pub mod sweep;
pub mod version;

pub use config::ManagerConfig;

pub struct AppState {
    pub pool: PgPool,
    pub cfg: ManagerConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(routes::auth::router())
        .merge(routes::agents::router())
        .merge(routes::exercises::router())
        .merge(routes::tasks::router())
        .merge(routes::agent::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            version::require_api_version,
        ))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

/// A running Manager bound to a concrete address; integration tests start
/// one on port 0 and shut it down explicitly.
pub struct ManagerServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ManagerServer {
    pub async fn start(
        pool: PgPool,
        cfg: ManagerConfig,
        bind: SocketAddr,
        enable_sweepers: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind manager to {bind}"))?;
        let addr = listener.local_addr().context("manager local_addr")?;

        let state = Arc::new(AppState { pool, cfg });
        let app = router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_manager(
            listener,
            app,
            state,
            shutdown_rx,
            enable_sweepers,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join manager task")??;
        Ok(())
    }
}

async fn run_manager(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
    enable_sweepers: bool,
) -> anyhow::Result<()> {
    let sweepers = if enable_sweepers {
        sweep::spawn_sweepers(state, shutdown_rx.clone())
    } else {
        Vec::new()
    };

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    tokio::select! {
        res = server => {
            res.context("manager serve")?;
        }
        _ = wait_shutdown(&mut shutdown_rx) => {}
    }

    for handle in sweepers {
        let _ = handle.await;
    }

    Ok(())
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
