use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_db::queries::dispatch_queue;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::event::TaskEvent;

use super::{backoff_for, Ack, AckId, DeliveredEvent, DispatchBus, DispatchError, QueueHandle, SubscribeOptions};

/// Poll interval for the claim loop when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Durable, Postgres-backed [`DispatchBus`].
///
/// There is no broker process: `publish` inserts a row into `dispatch_queue`
/// and `subscribe` starts a polling claim loop using
/// `SELECT ... FOR UPDATE SKIP LOCKED`, so multiple consumer tasks (or
/// processes sharing the same database) can drain the same queue without
/// double-claiming a row.
pub struct PostgresDispatchBus {
    pool: Arc<PgPool>,
}

impl PostgresDispatchBus {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchBus for PostgresDispatchBus {
    async fn publish(&self, topic: &str, event: TaskEvent) -> Result<(), DispatchError> {
        let payload = serde_json::to_value(&event)?;
        dispatch_queue::enqueue(&self.pool, topic, topic, payload, event.max_retries as i32)
            .await
            .map_err(DispatchError::Unavailable)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscribeOptions,
    ) -> Result<QueueHandle, DispatchError> {
        let (tx, rx) = mpsc::channel(options.prefetch.max(1));
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        let pool = self.pool.clone();
        let queue_name_owned = queue_name.to_owned();
        let enable_dlq = options.enable_dlq;

        // Ack-processing task: translates handler verdicts into row
        // mutations (delete / requeue with backoff / dead-letter).
        {
            let pool = pool.clone();
            let queue_name = queue_name_owned.clone();
            tokio::spawn(async move {
                while let Some(ack) = ack_rx.recv().await {
                    let result = match ack {
                        Ack::Ack(AckId::Row(id)) => dispatch_queue::ack(&pool, id).await,
                        Ack::Retry(AckId::Row(id)) => handle_retry(&pool, id, enable_dlq).await,
                        Ack::Fatal(AckId::Row(id), reason) => {
                            info!(queue = %queue_name, %reason, "handler reported fatal outcome");
                            dispatch_queue::ack(&pool, id).await
                        }
                        _ => Ok(()),
                    };
                    if let Err(err) = result {
                        error!(queue = %queue_name, %err, "failed to apply dispatch ack");
                    }
                }
            });
        }

        let prefetch = options.prefetch.max(1) as i64;
        let patterns = options.patterns;
        let task = tokio::spawn(async move {
            loop {
                let due = match claim_matching(&pool, &patterns, prefetch).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(queue = %queue_name_owned, %err, "failed to claim dispatch rows");
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    }
                };

                if due.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }

                for row in due {
                    let event: TaskEvent = match serde_json::from_value(row.event) {
                        Ok(event) => event,
                        Err(err) => {
                            error!(%err, "dropping unparseable dispatch row");
                            let _ = dispatch_queue::dead_letter(&pool, row.id, "unparseable_event").await;
                            continue;
                        }
                    };

                    let delivered = DeliveredEvent {
                        event,
                        routing_key: row.routing_key,
                        retry_count: row.retry_count as u32,
                        ack_tx: ack_tx.clone(),
                        id: AckId::Row(row.id),
                    };

                    if tx.send(delivered).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(QueueHandle::new(rx, task))
    }
}

/// How many due candidates to claim per poll relative to the caller's
/// `prefetch`, so that filtering out non-matching routing keys still leaves
/// enough rows to fill `limit` deliveries most polls.
const CLAIM_OVERSAMPLE: i64 = 4;

async fn claim_matching(
    pool: &PgPool,
    patterns: &[String],
    limit: i64,
) -> anyhow::Result<Vec<conduit_db::models::DispatchQueueRow>> {
    // `queue_name` on a row is the routing key the publisher used, not any
    // subscriber's name, so routing is a pattern match against `routing_key`
    // rather than an equality match in the claim query itself: claim a
    // batch of due candidates, keep the ones matching this subscriber's
    // patterns (up to `limit`), and release the rest so other subscribers
    // can still claim them.
    let candidates = dispatch_queue::claim_due_candidates(pool, limit.max(1) * CLAIM_OVERSAMPLE).await?;

    let mut matched = Vec::with_capacity(limit as usize);
    for row in candidates {
        let is_match = patterns.is_empty() || patterns.iter().any(|p| crate::event::topic_matches(p, &row.routing_key));
        if is_match && (matched.len() as i64) < limit {
            matched.push(row);
        } else {
            dispatch_queue::release_claim(pool, row.id).await?;
        }
    }
    Ok(matched)
}

async fn handle_retry(pool: &PgPool, id: i64, enable_dlq: bool) -> anyhow::Result<()> {
    let Some(row) = dispatch_queue::get(pool, id).await? else {
        return Ok(());
    };

    if enable_dlq && row.retry_count + 1 >= row.max_retries {
        dispatch_queue::dead_letter(pool, id, "max_retries_exceeded").await?;
    } else {
        let delay = backoff_for(row.retry_count as u32) as i64;
        dispatch_queue::nack_retry(pool, id, delay).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_sub_second() {
        assert!(POLL_INTERVAL < Duration::from_secs(1));
    }
}
