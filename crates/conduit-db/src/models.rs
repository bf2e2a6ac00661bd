use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Execution discipline an agent descriptor activates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Autonomous,
    Collaborative,
    Continuous,
    Scheduled,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Autonomous => "autonomous",
            Self::Collaborative => "collaborative",
            Self::Continuous => "continuous",
            Self::Scheduled => "scheduled",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentMode {
    type Err = AgentModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autonomous" => Ok(Self::Autonomous),
            "collaborative" => Ok(Self::Collaborative),
            "continuous" => Ok(Self::Continuous),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(AgentModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentMode`] string.
#[derive(Debug, Clone)]
pub struct AgentModeParseError(pub String);

impl fmt::Display for AgentModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent mode: {:?}", self.0)
    }
}

impl std::error::Error for AgentModeParseError {}

// ---------------------------------------------------------------------------

/// Status of an [`AgentRegistration`] in the Orchestrator's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registered,
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Terminal/intermediate status of an [`ExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`PlanRunRow`] (collaborative pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Running,
    WaitingClarification,
    Completed,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::WaitingClarification => "waiting_clarification",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "waiting_clarification" => Ok(Self::WaitingClarification),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Durable row for `execution_record`: the audit trail of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecordRow {
    pub execution_id: Uuid,
    pub agent_name: String,
    pub trace_id: Uuid,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retries: i32,
}

/// Durable row for `continuous_state`: one continuous agent's conversation/memory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContinuousStateRow {
    pub name: String,
    pub payload: Vec<u8>,
    pub compressed: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Durable row for `plan_run`: one collaborative task's plan state blob.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanRunRow {
    pub task_id: Uuid,
    pub plan: serde_json::Value,
    pub current_step: i32,
    pub status: PlanStatus,
    pub updated_at: DateTime<Utc>,
}

/// Durable row for `dispatch_queue`: one in-flight or pending bus message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatchQueueRow {
    pub id: i64,
    pub queue_name: String,
    pub routing_key: String,
    pub event: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Durable row for `dispatch_dlq`: a message that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatchDlqRow {
    pub id: i64,
    pub queue_name: String,
    pub routing_key: String,
    pub event: serde_json::Value,
    pub retry_count: i32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Durable row for `state_cache`: Tier B for the State Store's generic
/// key/value path (ad-hoc keyed state such as the Orchestrator's routing
/// cache), distinct from the typed `continuous_state`/`plan_run` tables.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StateCacheRow {
    pub key: String,
    pub payload: Vec<u8>,
    pub compressed: bool,
    pub updated_at: DateTime<Utc>,
}

/// Durable row for `agent_registration`: the Orchestrator's supervised state
/// per descriptor, persisted so `restart_count`/`status` survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRegistrationRow {
    pub agent_name: String,
    pub mode: AgentMode,
    pub status: AgentStatus,
    pub restart_count: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active_executions: i32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_mode_display_roundtrip() {
        let variants = [
            AgentMode::Autonomous,
            AgentMode::Collaborative,
            AgentMode::Continuous,
            AgentMode::Scheduled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentMode = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_mode_invalid() {
        assert!("bogus".parse::<AgentMode>().is_err());
    }

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Registered,
            AgentStatus::Starting,
            AgentStatus::Healthy,
            AgentStatus::Degraded,
            AgentStatus::Failed,
            AgentStatus::Stopped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        assert!("nope".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn execution_status_display_roundtrip() {
        let variants = [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        assert!("partial".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn execution_status_terminal() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn plan_status_display_roundtrip() {
        let variants = [
            PlanStatus::Planning,
            PlanStatus::Running,
            PlanStatus::WaitingClarification,
            PlanStatus::Completed,
            PlanStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PlanStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn plan_status_invalid() {
        assert!("bogus".parse::<PlanStatus>().is_err());
    }
}
