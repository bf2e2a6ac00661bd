//! Database query functions for the `plan_run` table (collaborative pool).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PlanRunRow, PlanStatus};

/// Upsert the plan state blob for a task. `UNIQUE(task_id)` makes this a
/// pure upsert with no version check — the collaborative pool serializes
/// writes to a given plan through a single owning task.
pub async fn save_plan(
    pool: &PgPool,
    task_id: Uuid,
    plan: serde_json::Value,
    current_step: i32,
    status: PlanStatus,
) -> Result<PlanRunRow> {
    let row = sqlx::query_as::<_, PlanRunRow>(
        "INSERT INTO plan_run (task_id, plan, current_step, status, updated_at) \
         VALUES ($1, $2, $3, $4, now()) \
         ON CONFLICT (task_id) DO UPDATE \
         SET plan = EXCLUDED.plan, \
             current_step = EXCLUDED.current_step, \
             status = EXCLUDED.status, \
             updated_at = now() \
         RETURNING *",
    )
    .bind(task_id)
    .bind(plan)
    .bind(current_step)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("failed to save plan run state")?;

    Ok(row)
}

pub async fn get_plan(pool: &PgPool, task_id: Uuid) -> Result<Option<PlanRunRow>> {
    let row = sqlx::query_as::<_, PlanRunRow>("SELECT * FROM plan_run WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan run state")?;

    Ok(row)
}

/// List every plan not yet in a terminal status, for crash recovery.
pub async fn list_active_plans(pool: &PgPool) -> Result<Vec<PlanRunRow>> {
    let rows = sqlx::query_as::<_, PlanRunRow>(
        "SELECT * FROM plan_run WHERE status NOT IN ($1, $2) ORDER BY updated_at ASC",
    )
    .bind(PlanStatus::Completed)
    .bind(PlanStatus::Failed)
    .fetch_all(pool)
    .await
    .context("failed to list active plans")?;

    Ok(rows)
}
