//! Database query functions for the `execution_record` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionRecordRow, ExecutionStatus};

/// Insert a new QUEUED execution record.
pub async fn append_execution(
    pool: &PgPool,
    execution_id: Uuid,
    agent_name: &str,
    trace_id: Uuid,
) -> Result<ExecutionRecordRow> {
    let row = sqlx::query_as::<_, ExecutionRecordRow>(
        "INSERT INTO execution_record (execution_id, agent_name, trace_id, status, submitted_at, retries) \
         VALUES ($1, $2, $3, $4, now(), 0) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(agent_name)
    .bind(trace_id)
    .bind(ExecutionStatus::Queued)
    .fetch_one(pool)
    .await
    .context("failed to insert execution record")?;

    Ok(row)
}

/// Transition an execution to RUNNING, stamping `started_at`.
pub async fn mark_running(pool: &PgPool, execution_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE execution_record SET status = $1, started_at = now() WHERE execution_id = $2",
    )
    .bind(ExecutionStatus::Running)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to mark execution running")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution {execution_id} not found");
    }
    Ok(())
}

/// Transition an execution to a terminal status, recording `result`/`error`.
///
/// Terminal execution records are append-only for audit, so this is only
/// ever called once per `execution_id`; callers must not retry a completed
/// transition.
pub async fn complete_execution(
    pool: &PgPool,
    execution_id: Uuid,
    status: ExecutionStatus,
    result: Option<serde_json::Value>,
    error: Option<&str>,
    retries: i32,
) -> Result<()> {
    anyhow::ensure!(status.is_terminal(), "complete_execution requires a terminal status");

    let res = sqlx::query(
        "UPDATE execution_record \
         SET status = $1, completed_at = now(), result = $2, error = $3, retries = $4 \
         WHERE execution_id = $5",
    )
    .bind(status)
    .bind(result)
    .bind(error)
    .bind(retries)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to complete execution")?;

    if res.rows_affected() == 0 {
        anyhow::bail!("execution {execution_id} not found");
    }
    Ok(())
}

pub async fn get_execution(pool: &PgPool, execution_id: Uuid) -> Result<Option<ExecutionRecordRow>> {
    let row = sqlx::query_as::<_, ExecutionRecordRow>(
        "SELECT * FROM execution_record WHERE execution_id = $1",
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch execution record")?;

    Ok(row)
}

/// List executions for an agent, most recent first, indexed by
/// `(agent_name, submitted_at)`.
pub async fn list_executions_for_agent(
    pool: &PgPool,
    agent_name: &str,
    limit: i64,
) -> Result<Vec<ExecutionRecordRow>> {
    let rows = sqlx::query_as::<_, ExecutionRecordRow>(
        "SELECT * FROM execution_record WHERE agent_name = $1 \
         ORDER BY submitted_at DESC LIMIT $2",
    )
    .bind(agent_name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list executions for agent")?;

    Ok(rows)
}

/// List the most recent executions across every agent, most recent first.
pub async fn list_recent(pool: &PgPool, limit: i64) -> Result<Vec<ExecutionRecordRow>> {
    let rows = sqlx::query_as::<_, ExecutionRecordRow>(
        "SELECT * FROM execution_record ORDER BY submitted_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent executions")?;

    Ok(rows)
}

/// List executions still queued or running before `before`, for crash
/// recovery on orchestrator restart.
pub async fn list_incomplete_before(
    pool: &PgPool,
    before: DateTime<Utc>,
) -> Result<Vec<ExecutionRecordRow>> {
    let rows = sqlx::query_as::<_, ExecutionRecordRow>(
        "SELECT * FROM execution_record \
         WHERE status IN ($1, $2) AND submitted_at < $3 \
         ORDER BY submitted_at ASC",
    )
    .bind(ExecutionStatus::Queued)
    .bind(ExecutionStatus::Running)
    .bind(before)
    .fetch_all(pool)
    .await
    .context("failed to list incomplete executions")?;

    Ok(rows)
}
