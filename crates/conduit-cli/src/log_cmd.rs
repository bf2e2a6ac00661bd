//! `conduit log` command: print the recorded result/error for an execution.

use anyhow::{Context, Result};
use conduit_db::queries::executions;
use sqlx::PgPool;
use uuid::Uuid;

/// Run the log command.
pub async fn run_log(pool: &PgPool, execution_id_str: &str) -> Result<()> {
    let execution_id = Uuid::parse_str(execution_id_str)
        .with_context(|| format!("invalid execution ID: {execution_id_str}"))?;

    let record = executions::get_execution(pool, execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} not found"))?;

    println!("execution {} ({})", record.execution_id, record.agent_name);
    println!(
        "submitted {}",
        record.submitted_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")
    );
    if let Some(started_at) = record.started_at {
        println!(
            "started   {}",
            started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")
        );
    }
    if let Some(completed_at) = record.completed_at {
        println!(
            "completed {}",
            completed_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")
        );
    }
    println!("status    {}", record.status);
    println!("retries   {}", record.retries);

    match (&record.result, &record.error) {
        (Some(result), _) => println!(
            "result:\n{}",
            serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
        ),
        (None, Some(error)) => println!("error:\n{error}"),
        (None, None) => println!("no result recorded yet"),
    }

    Ok(())
}
