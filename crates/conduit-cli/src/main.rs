mod bootstrap;
mod cancel_cmd;
mod config;
mod config_cmd;
mod log_cmd;
mod registry_cmd;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;

#[cfg(test)]
mod test_util;

use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use conduit_db::models::AgentMode;
use tokio_util::sync::CancellationToken;

use config::ConduitConfig;

#[derive(Parser)]
#[command(name = "conduit", about = "Multi-agent orchestration core")]
struct Cli {
    /// Database URL (overrides CONDUIT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a conduit config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/conduit")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the conduit database (requires config file or env vars)
    DbInit,
    /// Configuration Registry inspection
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Orchestrator agent-registration inspection
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Submit a task to an agent
    Submit {
        /// Agent name to submit to
        #[arg(long)]
        agent: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
        /// Execution priority
        #[arg(long)]
        priority: Option<i32>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Cancel a non-terminal execution
    Cancel {
        /// Execution ID to cancel
        execution_id: String,
    },
    /// Show one or all recent executions
    Status {
        /// Execution ID to show (omit to list recent executions)
        execution_id: Option<String>,
    },
    /// Print the recorded result/error for an execution
    Log {
        /// Execution ID to show
        execution_id: String,
    },
    /// Run the Orchestrator plus the operator REST server in the foreground
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate every descriptor in a directory, no watch
    Validate {
        /// Directory of agent descriptor YAML files
        config_dir: String,
    },
    /// List loaded descriptors
    List {
        /// Filter to a single mode: autonomous, collaborative, continuous, scheduled
        #[arg(long)]
        mode: Option<String>,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Show each AgentRegistration's status, restart count, heartbeat age
    Status,
}

/// Execute the `conduit init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        registry: config::RegistrySection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `conduit db-init` to create and migrate the database, then point");
    println!("CONFIG_DIR at a directory of agent descriptor YAML files.");

    Ok(())
}

/// Execute the `conduit db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    use conduit_db::pool;

    let resolved = ConduitConfig::resolve(cli_db_url)?;

    println!("Initializing conduit database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("conduit db-init complete.");
    Ok(())
}

async fn cmd_serve(cli_db_url: Option<&str>, bind: String, port: u16) -> anyhow::Result<()> {
    use conduit_db::pool;

    let resolved = ConduitConfig::resolve(cli_db_url)?;
    let db_pool = Arc::new(pool::create_pool(&resolved.db_config).await?);

    let registry_precheck = conduit_core::registry::Registry::load(resolved.config_dir.as_path()).await?;
    registry_precheck.check_startup_policy().await.map_err(|err| anyhow::anyhow!("{err}"))?;
    drop(registry_precheck);

    let cancel = CancellationToken::new();
    let (runtime, tasks) =
        bootstrap::build_and_activate(db_pool.clone(), &resolved.config_dir, resolved.hot_reload, cancel.clone())
            .await?;

    let state = serve_cmd::AppState {
        orchestrator: runtime.orchestrator.clone(),
        registry: runtime.registry.clone(),
        store: runtime.store.clone(),
    };

    serve_cmd::run_serve(state, &bind, port).await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    runtime.orchestrator.shutdown().await;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Validate { config_dir } => {
                config_cmd::run_validate(&config_dir).await?;
            }
            ConfigCommands::List { mode } => {
                let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
                let mode = mode
                    .map(|m| AgentMode::from_str(&m))
                    .transpose()
                    .map_err(|err| anyhow::anyhow!("{err}"))?;
                config_cmd::run_list(resolved.config_dir.to_str().unwrap_or("./agents"), mode).await?;
            }
        },
        Commands::Registry { command } => match command {
            RegistryCommands::Status => {
                let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
                let db_pool = conduit_db::pool::create_pool(&resolved.db_config).await?;
                let result = registry_cmd::run_status(&db_pool).await;
                db_pool.close().await;
                result?;
            }
        },
        Commands::Submit {
            agent,
            payload,
            priority,
            timeout,
        } => {
            let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = Arc::new(conduit_db::pool::create_pool(&resolved.db_config).await?);
            let parsed_payload: serde_json::Value =
                serde_json::from_str(&payload).map_err(|err| anyhow::anyhow!("invalid JSON payload: {err}"))?;
            let result =
                submit_cmd::run_submit(db_pool.clone(), &resolved.config_dir, &agent, parsed_payload, priority, timeout)
                    .await;
            if let Ok(pool) = Arc::try_unwrap(db_pool) {
                pool.close().await;
            }
            result?;
        }
        Commands::Cancel { execution_id } => {
            let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = Arc::new(conduit_db::pool::create_pool(&resolved.db_config).await?);
            let result = cancel_cmd::run_cancel(db_pool.clone(), &resolved.config_dir, &execution_id).await;
            if let Ok(pool) = Arc::try_unwrap(db_pool) {
                pool.close().await;
            }
            result?;
        }
        Commands::Status { execution_id } => {
            let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = conduit_db::pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, execution_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Log { execution_id } => {
            let resolved = ConduitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = conduit_db::pool::create_pool(&resolved.db_config).await?;
            let result = log_cmd::run_log(&db_pool, &execution_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            cmd_serve(cli.database_url.as_deref(), bind, port).await?;
        }
    }

    Ok(())
}
