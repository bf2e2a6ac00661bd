//! `conduit submit`: create a queued execution against a running (or
//! not-yet-running) agent fleet by publishing straight onto the durable bus.
//! Does not require `conduit serve` to already be up — the Dispatch Bus is
//! durable, so the event waits in Postgres until some process consumes it.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::bootstrap;

pub async fn run_submit(
    pool: Arc<PgPool>,
    config_dir: &std::path::Path,
    agent_name: &str,
    payload: serde_json::Value,
    priority: Option<i32>,
    timeout_seconds: Option<u64>,
) -> Result<()> {
    let runtime = bootstrap::build_minimal(pool, config_dir).await?;

    let mut event_payload = payload;
    if let (Some(priority), Some(obj)) = (priority, event_payload.as_object_mut()) {
        obj.insert("priority".to_owned(), serde_json::json!(priority));
    }
    if let (Some(timeout_seconds), Some(obj)) = (timeout_seconds, event_payload.as_object_mut()) {
        obj.insert("timeout_seconds".to_owned(), serde_json::json!(timeout_seconds));
    }

    let execution_id = runtime.orchestrator.submit(agent_name, event_payload, None).await?;
    let record = runtime.store.get_execution(execution_id).await?;
    let response = serde_json::json!({
        "execution_id": execution_id,
        "trace_id": record.trace_id,
        "status": "queued",
    });
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
