//! Replay cache for agent-side idempotent POSTs.
//!
//! Keyed on (Idempotency-Key, endpoint); the first successful response body
//! is stored and replayed verbatim for repeats. There is no eviction.

use anyhow::Context;
use serde_json::Value;
use sqlx::PgPool;

pub async fn cached_response(
    pool: &PgPool,
    key: &str,
    endpoint: &str,
) -> anyhow::Result<Option<Value>> {
    let cached: Option<(Value,)> = sqlx::query_as(
        r#"
        SELECT response
        FROM idempotency_log
        WHERE key = $1
          AND endpoint = $2
        "#,
    )
    .bind(key)
    .bind(endpoint)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("lookup idempotency key for {endpoint}"))?;

    Ok(cached.map(|(response,)| response))
}

pub async fn store_response(
    pool: &PgPool,
    key: &str,
    endpoint: &str,
    response: &Value,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_log (key, endpoint, response)
        VALUES ($1, $2, $3)
        ON CONFLICT (key, endpoint) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(endpoint)
    .bind(response)
    .execute(pool)
    .await
    .with_context(|| format!("store idempotency response for {endpoint}"))?;

    Ok(())
}
