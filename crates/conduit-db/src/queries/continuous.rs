//! Database query functions for the `continuous_state` table.
//!
//! Writes use optimistic concurrency on `version`: [`save_continuous`] only
//! succeeds when the stored version matches `expected_version`, per the
//! State Store's `StaleVersion` contract.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ContinuousStateRow;

/// Conditional upsert. On first write for `name` (no row yet), succeeds
/// unconditionally and starts the version at 1. Returns `Ok(true)` on
/// success, `Ok(false)` on a version mismatch (caller should reload and
/// retry, bounded per the Dispatch Bus's own retry budget).
pub async fn save_continuous(
    pool: &PgPool,
    name: &str,
    payload: &[u8],
    compressed: bool,
    expected_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO continuous_state (name, payload, compressed, version, updated_at) \
         VALUES ($1, $2, $3, 1, now()) \
         ON CONFLICT (name) DO UPDATE \
         SET payload = EXCLUDED.payload, \
             compressed = EXCLUDED.compressed, \
             version = continuous_state.version + 1, \
             updated_at = now() \
         WHERE continuous_state.version = $4",
    )
    .bind(name)
    .bind(payload)
    .bind(compressed)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to save continuous state")?;

    // An insert always affects a row; an update only affects one when the
    // WHERE clause's version check passed.
    if result.rows_affected() > 0 {
        return Ok(true);
    }

    // rows_affected() == 0 means either the update's version guard failed,
    // or (on first write) a concurrent insert raced us. Distinguish by
    // checking whether the row now exists with a different version.
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM continuous_state WHERE name = $1)")
        .bind(name)
        .fetch_one(pool)
        .await
        .context("failed to check continuous state existence")?;

    Ok(!exists)
}

pub async fn get_continuous(pool: &PgPool, name: &str) -> Result<Option<ContinuousStateRow>> {
    let row = sqlx::query_as::<_, ContinuousStateRow>(
        "SELECT * FROM continuous_state WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch continuous state")?;

    Ok(row)
}
