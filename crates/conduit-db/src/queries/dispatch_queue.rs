//! Database query functions for the durable `dispatch_queue` / `dispatch_dlq`
//! tables backing the Dispatch Bus.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{DispatchDlqRow, DispatchQueueRow};

/// Enqueue a message for durable delivery.
pub async fn enqueue(
    pool: &PgPool,
    queue_name: &str,
    routing_key: &str,
    event: serde_json::Value,
    max_retries: i32,
) -> Result<DispatchQueueRow> {
    let row = sqlx::query_as::<_, DispatchQueueRow>(
        "INSERT INTO dispatch_queue (queue_name, routing_key, event, retry_count, max_retries, next_attempt_at, created_at) \
         VALUES ($1, $2, $3, 0, $4, now(), now()) \
         RETURNING *",
    )
    .bind(queue_name)
    .bind(routing_key)
    .bind(event)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to enqueue dispatch message")?;

    Ok(row)
}

/// Claim up to `limit` unclaimed, due messages across the whole durable
/// queue.
///
/// `queue_name` is stamped at publish time with the routing key, not any
/// subscriber's name, so which rows belong to a given subscriber is a
/// pattern match against `routing_key` (see `crate::event::topic_matches`
/// in `conduit-core`), not an equality match against a column here. Callers
/// fetch a batch of due candidates and are expected to release
/// ([`release_claim`]) any that don't match their subscription patterns.
///
/// Uses `FOR UPDATE SKIP LOCKED` so multiple consumer tasks (or processes)
/// can poll concurrently without claiming the same row twice. Claimed rows
/// are stamped with `claimed_at`; a claim that is never acked, nacked, or
/// released within a lease window is eligible for reclaim by
/// [`reclaim_stale_claims`].
pub async fn claim_due_candidates(pool: &PgPool, limit: i64) -> Result<Vec<DispatchQueueRow>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let rows = sqlx::query_as::<_, DispatchQueueRow>(
        "SELECT * FROM dispatch_queue \
         WHERE claimed_at IS NULL AND next_attempt_at <= now() \
         ORDER BY next_attempt_at ASC \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(limit)
    .fetch_all(&mut *tx)
    .await
    .context("failed to select due dispatch messages")?;

    for row in &rows {
        sqlx::query("UPDATE dispatch_queue SET claimed_at = now() WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .context("failed to mark dispatch message claimed")?;
    }

    tx.commit().await.context("failed to commit claim transaction")?;
    Ok(rows)
}

/// Release a claim taken by [`claim_due_candidates`] on a row that turned
/// out not to match the caller's subscription patterns, so another
/// subscriber can claim it.
pub async fn release_claim(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("UPDATE dispatch_queue SET claimed_at = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to release dispatch claim")?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: i64) -> Result<Option<DispatchQueueRow>> {
    let row = sqlx::query_as::<_, DispatchQueueRow>("SELECT * FROM dispatch_queue WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dispatch message")?;
    Ok(row)
}

/// Acknowledge successful processing: delete the message.
pub async fn ack(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM dispatch_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to ack dispatch message")?;
    Ok(())
}

/// Negative-ack with requeue: bump `retry_count`, clear the claim, and push
/// `next_attempt_at` out by `delay_seconds` (the caller computes the
/// exponential backoff schedule).
pub async fn nack_retry(pool: &PgPool, id: i64, delay_seconds: i64) -> Result<()> {
    sqlx::query(
        "UPDATE dispatch_queue \
         SET retry_count = retry_count + 1, \
             claimed_at = NULL, \
             next_attempt_at = now() + make_interval(secs => $2) \
         WHERE id = $1",
    )
    .bind(id)
    .bind(delay_seconds as f64)
    .execute(pool)
    .await
    .context("failed to requeue dispatch message")?;
    Ok(())
}

/// Move a message that exhausted its retry budget to the DLQ.
pub async fn dead_letter(pool: &PgPool, id: i64, reason: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin dead-letter transaction")?;

    let row = sqlx::query_as::<_, DispatchQueueRow>("SELECT * FROM dispatch_queue WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch message to dead-letter")?;

    let Some(row) = row else {
        tx.commit().await.ok();
        return Ok(());
    };

    sqlx::query(
        "INSERT INTO dispatch_dlq (queue_name, routing_key, event, retry_count, reason, dead_lettered_at) \
         VALUES ($1, $2, $3, $4, $5, now())",
    )
    .bind(&row.queue_name)
    .bind(&row.routing_key)
    .bind(&row.event)
    .bind(row.retry_count + 1)
    .bind(reason)
    .execute(&mut *tx)
    .await
    .context("failed to insert dead-lettered message")?;

    sqlx::query("DELETE FROM dispatch_queue WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete dead-lettered message from live queue")?;

    tx.commit().await.context("failed to commit dead-letter transaction")?;
    Ok(())
}

/// Reclaim claims older than `lease`, e.g. after a consumer crash mid-processing.
pub async fn reclaim_stale_claims(
    pool: &PgPool,
    queue_name: &str,
    older_than: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dispatch_queue SET claimed_at = NULL \
         WHERE queue_name = $1 AND claimed_at IS NOT NULL AND claimed_at < $2",
    )
    .bind(queue_name)
    .bind(older_than)
    .execute(pool)
    .await
    .context("failed to reclaim stale dispatch claims")?;

    Ok(result.rows_affected())
}

pub async fn list_dlq(pool: &PgPool, queue_name: &str) -> Result<Vec<DispatchDlqRow>> {
    let rows = sqlx::query_as::<_, DispatchDlqRow>(
        "SELECT * FROM dispatch_dlq WHERE queue_name = $1 ORDER BY dead_lettered_at DESC",
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await
    .context("failed to list dead-lettered messages")?;

    Ok(rows)
}
