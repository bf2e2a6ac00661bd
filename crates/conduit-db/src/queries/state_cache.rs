//! Database query functions for the `state_cache` table: Tier B for the
//! State Store's generic key/value path.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::StateCacheRow;

/// Unconditional upsert of `key`'s payload.
pub async fn put(pool: &PgPool, key: &str, payload: &[u8], compressed: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO state_cache (key, payload, compressed, updated_at) \
         VALUES ($1, $2, $3, now()) \
         ON CONFLICT (key) DO UPDATE \
         SET payload = EXCLUDED.payload, compressed = EXCLUDED.compressed, updated_at = now()",
    )
    .bind(key)
    .bind(payload)
    .bind(compressed)
    .execute(pool)
    .await
    .context("failed to put state cache entry")?;
    Ok(())
}

pub async fn get(pool: &PgPool, key: &str) -> Result<Option<StateCacheRow>> {
    let row = sqlx::query_as::<_, StateCacheRow>("SELECT * FROM state_cache WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch state cache entry")?;
    Ok(row)
}
