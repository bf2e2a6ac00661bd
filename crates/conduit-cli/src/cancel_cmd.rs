//! `conduit cancel`: mark a non-terminal execution CANCELLED. Orchestrator
//! logic owns the terminal-state check; this is a thin CLI wrapper.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::bootstrap;

pub async fn run_cancel(pool: Arc<PgPool>, config_dir: &std::path::Path, execution_id_str: &str) -> Result<()> {
    let execution_id = Uuid::parse_str(execution_id_str)
        .with_context(|| format!("invalid execution ID: {execution_id_str}"))?;

    let runtime = bootstrap::build_minimal(pool, config_dir).await?;
    let (cancelled, previous_status) = runtime.orchestrator.cancel(execution_id).await?;

    let response = serde_json::json!({
        "cancelled": cancelled,
        "previous_status": previous_status,
    });
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
