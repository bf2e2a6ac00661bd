//! `conduit registry status`: each `AgentRegistration`'s status, restart
//! count, and heartbeat age, as persisted by a running (or previously run)
//! orchestrator process. Reads the database directly rather than the
//! Configuration Registry, since registration state only exists once an
//! orchestrator has activated a descriptor at least once.

use anyhow::Result;
use conduit_db::queries::registrations;
use sqlx::PgPool;

pub async fn run_status(pool: &PgPool) -> Result<()> {
    let rows = registrations::list_registrations(pool).await?;

    if rows.is_empty() {
        println!("No agent registrations recorded yet.");
        return Ok(());
    }

    println!(
        "{:<24} {:<14} {:<10} {:<8} {:<16}",
        "NAME", "MODE", "STATUS", "RESTARTS", "LAST HEARTBEAT"
    );
    println!("{}", "-".repeat(76));

    let now = chrono::Utc::now();
    for row in &rows {
        let heartbeat = match row.last_heartbeat {
            Some(hb) => format!("{}s ago", now.signed_duration_since(hb).num_seconds().max(0)),
            None => "never".to_owned(),
        };
        println!(
            "{:<24} {:<14} {:<10} {:<8} {:<16}",
            row.agent_name, row.mode, row.status, row.restart_count, heartbeat
        );
    }

    Ok(())
}
