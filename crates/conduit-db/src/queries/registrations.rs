//! Database query functions for the `agent_registration` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{AgentMode, AgentRegistrationRow, AgentStatus};

/// Upsert a registration row on agent activation.
pub async fn upsert_registration(
    pool: &PgPool,
    agent_name: &str,
    mode: AgentMode,
    status: AgentStatus,
) -> Result<AgentRegistrationRow> {
    let row = sqlx::query_as::<_, AgentRegistrationRow>(
        "INSERT INTO agent_registration (agent_name, mode, status, restart_count, active_executions, updated_at) \
         VALUES ($1, $2, $3, 0, 0, now()) \
         ON CONFLICT (agent_name) DO UPDATE \
         SET mode = EXCLUDED.mode, status = EXCLUDED.status, updated_at = now() \
         RETURNING *",
    )
    .bind(agent_name)
    .bind(mode)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("failed to upsert agent registration")?;

    Ok(row)
}

pub async fn set_status(pool: &PgPool, agent_name: &str, status: AgentStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE agent_registration SET status = $1, updated_at = now() WHERE agent_name = $2",
    )
    .bind(status)
    .bind(agent_name)
    .execute(pool)
    .await
    .context("failed to update agent registration status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent registration {agent_name} not found");
    }
    Ok(())
}

pub async fn record_heartbeat(pool: &PgPool, agent_name: &str) -> Result<()> {
    sqlx::query(
        "UPDATE agent_registration SET last_heartbeat = now(), updated_at = now() WHERE agent_name = $1",
    )
    .bind(agent_name)
    .execute(pool)
    .await
    .context("failed to record agent heartbeat")?;
    Ok(())
}

pub async fn increment_restart_count(pool: &PgPool, agent_name: &str) -> Result<i32> {
    let count: i32 = sqlx::query_scalar(
        "UPDATE agent_registration SET restart_count = restart_count + 1, updated_at = now() \
         WHERE agent_name = $1 \
         RETURNING restart_count",
    )
    .bind(agent_name)
    .fetch_one(pool)
    .await
    .context("failed to increment agent restart count")?;

    Ok(count)
}

pub async fn set_active_executions(pool: &PgPool, agent_name: &str, delta: i32) -> Result<()> {
    sqlx::query(
        "UPDATE agent_registration SET active_executions = active_executions + $1, updated_at = now() \
         WHERE agent_name = $2",
    )
    .bind(delta)
    .bind(agent_name)
    .execute(pool)
    .await
    .context("failed to update agent active execution count")?;
    Ok(())
}

pub async fn get_registration(pool: &PgPool, agent_name: &str) -> Result<Option<AgentRegistrationRow>> {
    let row = sqlx::query_as::<_, AgentRegistrationRow>(
        "SELECT * FROM agent_registration WHERE agent_name = $1",
    )
    .bind(agent_name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch agent registration")?;

    Ok(row)
}

pub async fn list_registrations(pool: &PgPool) -> Result<Vec<AgentRegistrationRow>> {
    let rows = sqlx::query_as::<_, AgentRegistrationRow>(
        "SELECT * FROM agent_registration ORDER BY agent_name ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list agent registrations")?;

    Ok(rows)
}
