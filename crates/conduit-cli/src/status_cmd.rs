//! `conduit status` command: show one execution's detail, or a recent-activity
//! listing across every agent.

use anyhow::{Context, Result};
use conduit_db::models::ExecutionRecordRow;
use conduit_db::queries::executions;
use sqlx::PgPool;
use uuid::Uuid;

const RECENT_LIMIT: i64 = 50;

/// Run the status command.
///
/// When `execution_id_str` is `Some`, shows full detail for that execution.
/// When `None`, lists the most recent executions across every agent.
pub async fn run_status(pool: &PgPool, execution_id_str: Option<&str>) -> Result<()> {
    match execution_id_str {
        Some(id_str) => run_execution_status(pool, id_str).await,
        None => run_recent_status(pool).await,
    }
}

async fn run_execution_status(pool: &PgPool, execution_id_str: &str) -> Result<()> {
    let execution_id = Uuid::parse_str(execution_id_str)
        .with_context(|| format!("invalid execution ID: {execution_id_str}"))?;

    let record = executions::get_execution(pool, execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} not found"))?;

    print_detail(&record);
    Ok(())
}

async fn run_recent_status(pool: &PgPool) -> Result<()> {
    let records = executions::list_recent(pool, RECENT_LIMIT).await?;

    if records.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<10} {:<20}",
        "EXECUTION ID", "AGENT", "STATUS", "SUBMITTED"
    );
    println!("{}", "-".repeat(96));

    for record in &records {
        println!(
            "{:<38} {:<24} {:<10} {:<20}",
            record.execution_id,
            record.agent_name,
            record.status,
            record.submitted_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }

    Ok(())
}

fn print_detail(record: &ExecutionRecordRow) {
    println!("Execution: {}", record.execution_id);
    println!("Agent: {}", record.agent_name);
    println!("Trace: {}", record.trace_id);
    println!("Status: {}", record.status);
    println!("Retries: {}", record.retries);
    println!(
        "Submitted: {}",
        record.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(started_at) = record.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = record.completed_at {
        println!(
            "Completed: {}",
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &record.error {
        println!("Error: {error}");
    }
    if let Some(result) = &record.result {
        println!(
            "Result: {}",
            serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
        );
    }
}
