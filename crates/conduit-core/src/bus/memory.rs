use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::event::{topic_matches, TaskEvent};

use super::{backoff_for, Ack, AckId, DeliveredEvent, DispatchBus, DispatchError, QueueHandle, SubscribeOptions};

#[derive(Clone)]
struct Pending {
    event: TaskEvent,
    routing_key: String,
    retry_count: u32,
}

/// In-process [`DispatchBus`] double, grounded on the same claim/ack/DLQ
/// shape as [`super::PostgresDispatchBus`] but backed by a `VecDeque`
/// instead of a table. Used in integration tests that exercise handler
/// outcome semantics without a database.
pub struct InMemoryDispatchBus {
    queue: Arc<Mutex<VecDeque<Pending>>>,
    dlq: Arc<Mutex<Vec<(Pending, String)>>>,
}

impl Default for InMemoryDispatchBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDispatchBus {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            dlq: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of messages currently in the dead-letter queue, for test
    /// assertions.
    pub async fn dlq_len(&self) -> usize {
        self.dlq.lock().await.len()
    }

    /// Number of messages still waiting to be claimed, for test assertions.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl DispatchBus for InMemoryDispatchBus {
    async fn publish(&self, topic: &str, event: TaskEvent) -> Result<(), DispatchError> {
        self.queue.lock().await.push_back(Pending {
            event,
            routing_key: topic.to_owned(),
            retry_count: 0,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscribeOptions,
    ) -> Result<QueueHandle, DispatchError> {
        let (tx, rx) = mpsc::channel(options.prefetch.max(1));
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        let queue = self.queue.clone();
        let dlq = self.dlq.clone();
        let queue_name = queue_name.to_owned();
        let patterns = options.patterns;
        let max_retries = options.max_retries;

        let inflight: Arc<Mutex<HashMap<u64, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_seq = Arc::new(AtomicU64::new(0));

        // Ack-processing task: applies ack/retry/fatal decisions back onto
        // the shared queue/DLQ state.
        {
            let inflight = inflight.clone();
            let dlq = dlq.clone();
            let queue = queue.clone();
            let queue_name = queue_name.clone();
            tokio::spawn(async move {
                while let Some(ack) = ack_rx.recv().await {
                    match ack {
                        Ack::Ack(AckId::Seq(id)) => {
                            inflight.lock().await.remove(&id);
                        }
                        Ack::Retry(AckId::Seq(id)) => {
                            if let Some(mut pending) = inflight.lock().await.remove(&id) {
                                pending.retry_count += 1;
                                if pending.retry_count >= max_retries {
                                    warn!(
                                        queue = %queue_name,
                                        retry_count = pending.retry_count,
                                        "message exceeded max_retries, dead-lettering"
                                    );
                                    dlq.lock().await.push((pending, "max_retries_exceeded".to_owned()));
                                } else {
                                    let delay = backoff_for(pending.retry_count);
                                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                                    queue.lock().await.push_back(pending);
                                }
                            }
                        }
                        Ack::Fatal(AckId::Seq(id), reason) => {
                            if inflight.lock().await.remove(&id).is_some() {
                                info!(queue = %queue_name, %reason, "handler reported fatal outcome");
                            }
                        }
                        _ => {}
                    }
                }
            });
        }

        let task = tokio::spawn(async move {
            loop {
                let popped = {
                    let mut q = queue.lock().await;
                    let pos = q
                        .iter()
                        .position(|p| patterns.iter().any(|pat| topic_matches(pat, &p.routing_key)));
                    pos.map(|i| q.remove(i).expect("position came from iter"))
                };

                let Some(pending) = popped else {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    continue;
                };

                let seq = next_seq.fetch_add(1, Ordering::Relaxed);
                let delivered = DeliveredEvent {
                    event: pending.event.clone(),
                    routing_key: pending.routing_key.clone(),
                    retry_count: pending.retry_count,
                    ack_tx: ack_tx.clone(),
                    id: AckId::Seq(seq),
                };
                inflight.lock().await.insert(seq, pending);

                if tx.send(delivered).await.is_err() {
                    return;
                }
            }
        });

        Ok(QueueHandle::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_and_acks() {
        let bus = InMemoryDispatchBus::new();
        bus.publish("autonomous.task.submitted", TaskEvent::new("autonomous.task.submitted", serde_json::json!({})))
            .await
            .unwrap();

        let mut handle = bus
            .subscribe(
                "autonomous-pool",
                SubscribeOptions {
                    patterns: vec!["autonomous.task.submitted".to_owned()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let delivered = handle.receiver.recv().await.expect("should deliver");
        assert_eq!(delivered.routing_key, "autonomous.task.submitted");
        delivered.ack().await;
    }

    #[tokio::test]
    async fn retryable_outcome_redelivers_until_dlq() {
        let bus = InMemoryDispatchBus::new();
        bus.publish("autonomous.task.submitted", TaskEvent::new("autonomous.task.submitted", serde_json::json!({})))
            .await
            .unwrap();

        let mut handle = bus
            .subscribe(
                "autonomous-pool",
                SubscribeOptions {
                    patterns: vec!["autonomous.task.submitted".to_owned()],
                    max_retries: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = handle.receiver.recv().await.unwrap();
        first.retry().await;

        // Give the ack task time to requeue (backoff_for(1) == 2s).
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        let second = handle.receiver.recv().await.unwrap();
        second.retry().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.dlq_len().await, 1);
    }
}
