//! Background sweepers.
//!
//! Four independent loops, each enforcing exactly one wall-clock rule. All
//! of them are idempotent: every mutation is conditioned inside the
//! statement, so rerunning a sweep over the same state is a no-op. Startup
//! is staggered to avoid all four contending for locks on first tick.

use crate::AppState;
use anyhow::Context;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

pub fn spawn_sweepers(
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<anyhow::Result<()>>> {
    let cfg = &state.cfg;
    vec![
        tokio::spawn(sweep_loop(
            "offline_marker",
            Duration::from_millis(500),
            Duration::from_secs(cfg.offline_sweep_secs),
            state.clone(),
            shutdown_rx.clone(),
            |state| async move {
                let marked =
                    mark_offline_once(&state.pool, state.cfg.agent_liveness_window_secs).await?;
                if marked > 0 {
                    tracing::info!(
                        event = "manager.sweep.offline",
                        marked,
                        "agents marked offline"
                    );
                }
                Ok(())
            },
        )),
        tokio::spawn(sweep_loop(
            "timeout_sweeper",
            Duration::from_millis(1_000),
            Duration::from_secs(cfg.timeout_sweep_secs),
            state.clone(),
            shutdown_rx.clone(),
            |state| async move {
                let timed_out =
                    timeout_clients_once(&state.pool, state.cfg.client_task_grace_secs).await?;
                if timed_out > 0 {
                    tracing::info!(
                        event = "manager.sweep.timeout",
                        timed_out,
                        "client tasks timed out"
                    );
                }
                Ok(())
            },
        )),
        tokio::spawn(sweep_loop(
            "reservation_cleanup",
            Duration::from_millis(1_500),
            Duration::from_secs(cfg.reservation_sweep_secs),
            state.clone(),
            shutdown_rx.clone(),
            |state| async move {
                let (terminal, stale) =
                    release_reservations_once(&state.pool, state.cfg.reservation_max_age_secs)
                        .await?;
                if terminal > 0 || stale > 0 {
                    tracing::info!(
                        event = "manager.sweep.reservations",
                        terminal,
                        stale,
                        "port reservations released"
                    );
                }
                Ok(())
            },
        )),
        tokio::spawn(sweep_loop(
            "exercise_auto_ender",
            Duration::from_millis(2_000),
            Duration::from_secs(cfg.auto_end_sweep_secs),
            state.clone(),
            shutdown_rx,
            |state| async move {
                let ended = auto_end_exercises_once(&state.pool).await?;
                if ended > 0 {
                    tracing::info!(
                        event = "manager.sweep.auto_end",
                        ended,
                        "exercises auto-ended"
                    );
                }
                Ok(())
            },
        )),
    ]
}

async fn sweep_loop<F, Fut>(
    name: &'static str,
    stagger: Duration,
    interval: Duration,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) -> anyhow::Result<()>
where
    F: Fn(Arc<AppState>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        _ = tokio::time::sleep(stagger) => {}
        _ = shutdown_rx.changed() => {}
    }

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if let Err(err) = tick(state.clone()).await {
            tracing::warn!(event = "manager.sweep.error", sweeper = name, error = %err, "sweep error");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

/// Flip agents with a stale (or absent) heartbeat from online to offline.
pub async fn mark_offline_once(pool: &PgPool, liveness_window_secs: i64) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE agents
        SET status = 'offline'
        WHERE status = 'online'
          AND (last_heartbeat IS NULL
               OR last_heartbeat < now() - make_interval(secs => $1::double precision))
        "#,
    )
    .bind(liveness_window_secs as f64)
    .execute(pool)
    .await
    .context("mark stale agents offline")?;

    Ok(result.rows_affected())
}

/// Time out running client tasks past `started_at + payload time + grace`.
pub async fn timeout_clients_once(pool: &PgPool, grace_secs: i64) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'timed_out',
            finished_at = now()
        WHERE type = 'iperf_client_run'
          AND status = 'running'
          AND started_at IS NOT NULL
          AND started_at
              + make_interval(
                  secs => COALESCE((payload->>'time')::double precision, 30) + $1::double precision
                )
              < now()
        "#,
    )
    .bind(grace_secs as f64)
    .execute(pool)
    .await
    .context("time out overdue client tasks")?;

    Ok(result.rows_affected())
}

/// Release reservations whose server task reached a terminal state, plus any
/// reservation older than the stale cutoff regardless of task state.
pub async fn release_reservations_once(
    pool: &PgPool,
    max_age_secs: i64,
) -> anyhow::Result<(u64, u64)> {
    let terminal = sqlx::query(
        r#"
        UPDATE port_reservations
        SET released_at = now()
        WHERE released_at IS NULL
          AND task_id IN (
            SELECT id FROM tasks
            WHERE type = 'iperf_server_start'
              AND status IN ('succeeded', 'failed', 'canceled', 'timed_out')
          )
        "#,
    )
    .execute(pool)
    .await
    .context("release reservations of terminal server tasks")?
    .rows_affected();

    let stale = sqlx::query(
        r#"
        UPDATE port_reservations
        SET released_at = now()
        WHERE released_at IS NULL
          AND created_at < now() - make_interval(secs => $1::double precision)
        "#,
    )
    .bind(max_age_secs as f64)
    .execute(pool)
    .await
    .context("release stale reservations")?
    .rows_affected();

    Ok((terminal, stale))
}

/// End started exercises whose tasks have all reached a terminal state:
/// stamp `ended_at`, enqueue `kill_all` for every involved agent, release
/// the exercise's reservations. One transaction per exercise.
pub async fn auto_end_exercises_once(pool: &PgPool) -> anyhow::Result<u64> {
    let candidates: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM exercises
        WHERE started_at IS NOT NULL
          AND ended_at IS NULL
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list running exercises")?;

    let mut ended = 0;
    for (exercise_id,) in candidates {
        if try_end_exercise(pool, exercise_id)
            .await
            .with_context(|| format!("auto-end exercise {exercise_id}"))?
        {
            ended += 1;
        }
    }

    Ok(ended)
}

async fn try_end_exercise(pool: &PgPool, exercise_id: i64) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await.context("begin auto-end tx")?;

    // Lock the exercise so a concurrent stop or a second sweeper instance
    // serializes behind us; the ended_at recheck makes the race a no-op.
    let still_open: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM exercises
        WHERE id = $1
          AND started_at IS NOT NULL
          AND ended_at IS NULL
        FOR UPDATE
        "#,
    )
    .bind(exercise_id)
    .fetch_optional(&mut *tx)
    .await
    .context("lock exercise")?;

    if still_open.is_none() {
        tx.commit().await.context("commit auto-end tx")?;
        return Ok(false);
    }

    let (open_tasks,): (i64,) = sqlx::query_as(
        r#"
        SELECT count(*)
        FROM tasks
        WHERE id IN (
            SELECT server_task_id FROM tests WHERE exercise_id = $1 AND server_task_id IS NOT NULL
            UNION
            SELECT client_task_id FROM tests WHERE exercise_id = $1 AND client_task_id IS NOT NULL
        )
          AND status NOT IN ('succeeded', 'failed', 'canceled', 'timed_out')
        "#,
    )
    .bind(exercise_id)
    .fetch_one(&mut *tx)
    .await
    .context("count non-terminal tasks")?;

    if open_tasks > 0 {
        tx.commit().await.context("commit auto-end tx")?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE exercises
        SET ended_at = now()
        WHERE id = $1
        "#,
    )
    .bind(exercise_id)
    .execute(&mut *tx)
    .await
    .context("stamp ended_at")?;

    sqlx::query(
        r#"
        INSERT INTO tasks (type, agent_id, status, payload)
        SELECT 'kill_all', involved.agent_id, 'pending', '{}'::jsonb
        FROM (
            SELECT server_agent_id AS agent_id FROM tests WHERE exercise_id = $1
            UNION
            SELECT client_agent_id FROM tests WHERE exercise_id = $1
        ) involved
        "#,
    )
    .bind(exercise_id)
    .execute(&mut *tx)
    .await
    .context("enqueue kill_all tasks")?;

    sqlx::query(
        r#"
        UPDATE port_reservations
        SET released_at = now()
        WHERE released_at IS NULL
          AND task_id IN (
            SELECT server_task_id FROM tests
            WHERE exercise_id = $1 AND server_task_id IS NOT NULL
          )
        "#,
    )
    .bind(exercise_id)
    .execute(&mut *tx)
    .await
    .context("release exercise reservations")?;

    tx.commit().await.context("commit auto-end tx")?;
    Ok(true)
}
