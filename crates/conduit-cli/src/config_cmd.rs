//! `conduit config validate`/`conduit config list`: Configuration Registry
//! inspection commands. Both load the descriptor directory once and report
//! on the resulting snapshot; neither touches the database.

use anyhow::Result;
use conduit_core::registry::Registry;
use conduit_db::models::AgentMode;

/// Load every descriptor under `config_dir`, print parse/validation errors
/// and the startup failure-policy verdict, and exit non-zero if the policy
/// would refuse to start.
pub async fn run_validate(config_dir: &str) -> Result<()> {
    let registry = Registry::load(config_dir).await?;

    let errors = registry.errors().await;
    let loaded = registry.list().await;

    println!("{} descriptor(s) loaded, {} error(s)", loaded.len(), errors.len());
    for err in &errors {
        println!("  ERROR {}: {}", err.file.display(), err.reason);
    }
    for descriptor in &loaded {
        println!("  OK    {} ({})", descriptor.name, descriptor.mode);
    }

    match registry.check_startup_policy().await {
        Ok(()) => {
            println!("startup policy: OK");
            Ok(())
        }
        Err(err) => {
            println!("startup policy: REFUSED ({err})");
            anyhow::bail!("{err}");
        }
    }
}

/// List loaded descriptors, optionally filtered to a single mode.
pub async fn run_list(config_dir: &str, mode: Option<AgentMode>) -> Result<()> {
    let registry = Registry::load(config_dir).await?;

    let descriptors = match mode {
        Some(mode) => registry.list_by_mode(mode).await,
        None => registry.list().await,
    };

    if descriptors.is_empty() {
        println!("No descriptors loaded.");
        return Ok(());
    }

    println!("{:<24} {:<14} {:<12} {:<10}", "NAME", "MODE", "PROVIDER", "MODEL");
    println!("{}", "-".repeat(64));
    for descriptor in &descriptors {
        println!(
            "{:<24} {:<14} {:<12} {:<10}",
            descriptor.name, descriptor.mode, descriptor.llm.provider, descriptor.llm.model
        );
    }

    Ok(())
}
