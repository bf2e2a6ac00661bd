//! Shared orchestration-core bootstrap: wires the Configuration Registry,
//! Dispatch Bus, State Store, Orchestrator, Provider registry, and the three
//! execution disciplines into one running set of background tasks.
//!
//! Used by `conduit serve`; `conduit submit`/`conduit cancel` use the
//! lighter-weight [`build_minimal`] since they only need the Orchestrator's
//! routing surface, not a running consumer.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use conduit_core::bus::{PostgresDispatchBus, SharedDispatchBus};
use conduit_core::orchestrator::{Orchestrator, OrchestratorConfig};
use conduit_core::pool::{
    AutonomousPool, AutonomousPoolConfig, CollaborativePool, CollaborativePoolConfig, ContinuousRunner,
    ContinuousRunnerConfig,
};
use conduit_core::provider::{HttpProvider, HttpProviderConfig, Provider, ProviderRegistry};
use conduit_core::registry::Registry;
use conduit_core::scheduler::Scheduler;
use conduit_core::state_store::StateStore;
use conduit_db::models::AgentMode;

/// Every piece needed to run the orchestration core as one process.
pub struct Runtime {
    pub registry: Arc<Registry>,
    pub bus: SharedDispatchBus,
    pub store: Arc<StateStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub providers: Arc<ProviderRegistry>,
}

/// Provider names the Configuration Registry's fixed secret table knows how
/// to inject credentials for; a provider registry is pre-populated with a
/// skeleton [`HttpProvider`] for each so any descriptor referencing one of
/// these resolves, without guessing at others the corpus doesn't define.
const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "bedrock", "ollama"];

/// Build the minimal set of components `submit`/`cancel` need: a loaded
/// (unwatched) registry, a durable bus, and the orchestrator atop them. No
/// discipline consumers are started.
pub async fn build_minimal(
    pool: Arc<PgPool>,
    config_dir: &std::path::Path,
) -> Result<Runtime> {
    let registry = Arc::new(
        Registry::load(config_dir)
            .await
            .with_context(|| format!("failed to load descriptors from {}", config_dir.display()))?,
    );
    let bus: SharedDispatchBus = Arc::new(PostgresDispatchBus::new(pool.clone()));
    let store = Arc::new(StateStore::new(pool.clone()));
    let providers = Arc::new(build_provider_registry());
    let orchestrator = Arc::new(Orchestrator::new(
        pool,
        registry.clone(),
        bus.clone(),
        store.clone(),
        OrchestratorConfig::default(),
    ));

    Ok(Runtime {
        registry,
        bus,
        store,
        orchestrator,
        providers,
    })
}

fn build_provider_registry() -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    for name in KNOWN_PROVIDERS {
        let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(HttpProviderConfig {
            name: (*name).to_owned(),
            base_url: String::new(),
            api_key: None,
        }));
        registry.register(provider);
    }
    registry
}

/// Build the full runtime and activate every loaded descriptor onto its
/// discipline, starting the background tasks `conduit serve` keeps alive
/// until shutdown. Returns the runtime plus the join handles for every
/// spawned task so the caller can await graceful drain.
pub async fn build_and_activate(
    pool: Arc<PgPool>,
    config_dir: &std::path::Path,
    hot_reload: bool,
    cancel: CancellationToken,
) -> Result<(Runtime, Vec<tokio::task::JoinHandle<()>>)> {
    let runtime = build_minimal(pool, config_dir).await?;

    if hot_reload {
        // Held for the process lifetime; dropping it would stop the watch.
        std::mem::forget(
            runtime
                .registry
                .watch()
                .context("failed to start configuration registry watcher")?,
        );
    }

    let mut tasks = Vec::new();

    let autonomous = Arc::new(AutonomousPool::new(
        runtime.bus.clone(),
        runtime.store.clone(),
        runtime.registry.clone(),
        runtime.providers.clone(),
        AutonomousPoolConfig::default(),
    ));
    let continuous = Arc::new(ContinuousRunner::new(
        runtime.bus.clone(),
        runtime.store.clone(),
        runtime.providers.clone(),
        ContinuousRunnerConfig::default(),
    ));
    let collaborative = Arc::new(CollaborativePool::new(
        runtime.bus.clone(),
        runtime.store.clone(),
        runtime.providers.clone(),
        runtime.registry.clone(),
        CollaborativePoolConfig::default(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        runtime.orchestrator.clone(),
        runtime.store.clone(),
        runtime.bus.clone(),
    ));

    let descriptors = runtime.registry.list().await;
    let mut started_autonomous = false;
    let mut started_collaborative = false;
    let mut started_scheduler_tap = false;

    for descriptor in descriptors {
        let orchestrator = runtime.orchestrator.clone();
        match descriptor.mode {
            AgentMode::Autonomous => {
                if !started_autonomous {
                    started_autonomous = true;
                    let pool = autonomous.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = pool.run(cancel).await {
                            tracing::warn!(%err, "autonomous pool exited");
                        }
                    }));
                }
                orchestrator
                    .activate(descriptor.clone(), |_cancel| async move { Ok(()) })
                    .await
                    .with_context(|| format!("failed to activate {}", descriptor.name))?;
            }
            AgentMode::Collaborative => {
                if !started_collaborative {
                    started_collaborative = true;
                    let pool = collaborative.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = pool.run(cancel).await {
                            tracing::warn!(%err, "collaborative pool exited");
                        }
                    }));
                    let pool = collaborative.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = pool.run_clarification_timeouts(cancel).await {
                            tracing::warn!(%err, "collaborative clarification timeout loop exited");
                        }
                    }));
                }
                orchestrator
                    .activate(descriptor.clone(), |_cancel| async move { Ok(()) })
                    .await
                    .with_context(|| format!("failed to activate {}", descriptor.name))?;
            }
            AgentMode::Continuous => {
                let runner = continuous.clone();
                let desc = descriptor.clone();
                orchestrator
                    .activate(descriptor.clone(), move |cancel| async move {
                        runner.run(desc, cancel).await
                    })
                    .await
                    .with_context(|| format!("failed to activate {}", descriptor.name))?;
            }
            AgentMode::Scheduled => {
                if !started_scheduler_tap {
                    started_scheduler_tap = true;
                    let sched = scheduler.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = sched.run_completion_tap(cancel).await {
                            tracing::warn!(%err, "scheduler completion tap exited");
                        }
                    }));
                }
                let sched = scheduler.clone();
                let desc = descriptor.clone();
                orchestrator
                    .activate(descriptor.clone(), move |cancel| async move {
                        sched.run(desc, cancel).await
                    })
                    .await
                    .with_context(|| format!("failed to activate {}", descriptor.name))?;
            }
        }
    }

    // Idle-flush ticker for continuous state, started regardless of whether
    // any CONTINUOUS descriptor is loaded yet (hot reload may add one).
    {
        let runner = continuous.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = runner.run_idle_flush(cancel).await {
                tracing::warn!(%err, "continuous idle-flush ticker exited");
            }
        }));
    }

    // Heartbeat supervisor.
    {
        let orchestrator = runtime.orchestrator.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conduit_core::orchestrator::HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => orchestrator.supervise_once().await,
                }
            }
        }));
    }

    Ok((runtime, tasks))
}
