//! The wire event envelope and its routing-key pattern matcher.

mod topic;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use topic::topic_matches;

/// The `TaskEvent` wire envelope, carried as JSON through the Dispatch Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
    #[serde(default)]
    pub parent_event_id: Option<Uuid>,
    #[serde(default = "TaskEvent::default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "TaskEvent::default_max_retries")]
    pub max_retries: u32,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
}

impl TaskEvent {
    const fn default_priority() -> u8 {
        0
    }

    const fn default_max_retries() -> u32 {
        3
    }

    /// Build a fresh top-of-chain event: new `event_id`, `trace_id` set at
    /// ingress, no parent.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let trace_id = Uuid::new_v4();
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            trace_id,
            parent_event_id: None,
            priority: Self::default_priority(),
            retry_count: 0,
            max_retries: Self::default_max_retries(),
            payload,
            agent_name: None,
            execution_id: None,
        }
    }

    /// Derive a new event from this one, preserving `trace_id` and recording
    /// this event as the parent, per the wire-envelope invariant.
    pub fn derive(&self, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            trace_id: self.trace_id,
            parent_event_id: Some(self.event_id),
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            payload,
            agent_name: self.agent_name.clone(),
            execution_id: self.execution_id,
        }
    }

    /// A synthetic `*.failed` event carrying the original trace, per the
    /// Dispatch Bus's Fatal-outcome contract.
    pub fn failed(&self, error: impl std::fmt::Display) -> Self {
        let event_type = format!("{}.failed", self.event_type);
        self.derive(event_type, serde_json::json!({ "error": error.to_string() }))
    }
}

/// A handler's verdict on a delivered event, mapped to the Dispatch Bus's
/// ack/requeue/DLQ semantics by the bus implementation.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Processed successfully; acknowledge.
    Ack,
    /// Transient failure; negative-ack with requeue and backoff.
    Retryable(anyhow::Error),
    /// Permanent failure; acknowledge and emit a `*.failed` event.
    Fatal(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_preserves_trace_id_and_sets_parent() {
        let root = TaskEvent::new("autonomous.task.submitted", serde_json::json!({}));
        let child = root.derive("autonomous.task.completed", serde_json::json!({"ok": true}));
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_event_id, Some(root.event_id));
        assert_ne!(child.event_id, root.event_id);
    }

    #[test]
    fn failed_event_carries_trace_and_error() {
        let root = TaskEvent::new("autonomous.task.submitted", serde_json::json!({}));
        let failed = root.failed("boom");
        assert_eq!(failed.event_type, "autonomous.task.submitted.failed");
        assert_eq!(failed.trace_id, root.trace_id);
        assert_eq!(failed.payload["error"], "boom");
    }
}
