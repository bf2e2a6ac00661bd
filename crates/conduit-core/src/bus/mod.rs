//! Dispatch Bus (C2): a durable topic-routed message broker abstraction.
//!
//! The core never speaks AMQP directly; every consumer and producer speaks
//! the [`DispatchBus`] contract instead. The durable implementation is
//! backed by Postgres ([`postgres::PostgresDispatchBus`]); [`memory`]
//! provides an in-process double for tests.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::TaskEvent;

pub use memory::InMemoryDispatchBus;
pub use postgres::PostgresDispatchBus;

/// Exponential backoff schedule for requeue delay, indexed by `retry_count`.
pub const BACKOFF_SCHEDULE_SECONDS: [u64; 5] = [1, 2, 4, 8, 16];

pub fn backoff_for(retry_count: u32) -> u64 {
    let idx = (retry_count as usize).min(BACKOFF_SCHEDULE_SECONDS.len() - 1);
    BACKOFF_SCHEDULE_SECONDS[idx]
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue {queue} is full (max {max})")]
    QueueFull { queue: String, max: usize },
    #[error("broker unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Options controlling a [`DispatchBus::subscribe`] call.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub patterns: Vec<String>,
    pub prefetch: usize,
    pub enable_dlq: bool,
    pub max_retries: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            prefetch: 1,
            enable_dlq: true,
            max_retries: 3,
        }
    }
}

/// A message delivered to a subscriber, along with the handle the
/// subscriber uses to report the handler outcome back to the bus.
pub struct DeliveredEvent {
    pub event: TaskEvent,
    pub routing_key: String,
    pub retry_count: u32,
    ack_tx: mpsc::UnboundedSender<Ack>,
    id: AckId,
}

enum Ack {
    Ack(AckId),
    Retry(AckId),
    Fatal(AckId, String),
}

/// Opaque per-implementation identifier for an in-flight delivery; a
/// Postgres row id for the durable bus, a sequence number for the in-memory
/// double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckId {
    Row(i64),
    Seq(u64),
}

impl DeliveredEvent {
    pub async fn ack(self) {
        let _ = self.ack_tx.send(Ack::Ack(self.id));
    }

    pub async fn retry(self) {
        let _ = self.ack_tx.send(Ack::Retry(self.id));
    }

    pub async fn fatal(self, reason: impl Into<String>) {
        let _ = self.ack_tx.send(Ack::Fatal(self.id, reason.into()));
    }
}

/// A live subscription: the receiving half of delivered events, plus the
/// background task handle driving the claim loop. Dropping this stops the
/// subscription.
pub struct QueueHandle {
    pub receiver: mpsc::Receiver<DeliveredEvent>,
    _task: tokio::task::JoinHandle<()>,
}

impl QueueHandle {
    fn new(receiver: mpsc::Receiver<DeliveredEvent>, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            receiver,
            _task: task,
        }
    }
}

/// The Dispatch Bus contract: durable topic-routed publish/subscribe with
/// DLQ semantics.
///
/// Object-safe: every method returns a concrete or boxed type, so the
/// Orchestrator holds this as `Arc<dyn DispatchBus>`.
#[async_trait]
pub trait DispatchBus: Send + Sync {
    /// Publish `event` to `topic`. Returns only after the broker has
    /// acknowledged durable persistence.
    async fn publish(&self, topic: &str, event: TaskEvent) -> Result<(), DispatchError>;

    /// Declare (if absent) a durable queue bound to `options.patterns` and
    /// start delivering matching events into the returned [`QueueHandle`].
    async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscribeOptions,
    ) -> Result<QueueHandle, DispatchError>;
}

pub type SharedDispatchBus = Arc<dyn DispatchBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_indexed_and_clamped() {
        assert_eq!(backoff_for(0), 1);
        assert_eq!(backoff_for(4), 16);
        assert_eq!(backoff_for(100), 16);
    }
}
