//! Orchestrator (C4): owns the `AgentRegistration` map, activates registered
//! agents onto the discipline matching their mode, supervises health, and
//! routes operator/event submissions to the right routing key.

mod state_machine;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit_db::models::AgentStatus;
use conduit_db::queries::registrations;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::SharedDispatchBus;
use crate::descriptor::AgentDescriptor;
use crate::event::TaskEvent;
use crate::registry::Registry;
use crate::state_store::StateStore;

pub use state_machine::is_valid_transition;

/// Heartbeat staleness beyond which a HEALTHY agent is marked DEGRADED.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(180);
/// Heartbeat poll interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Grace period for draining in-flight executions on shutdown or descriptor reload.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Restarts permitted before an agent is marked FAILED for good.
pub const MAX_RESTARTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_restarts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
            max_restarts: MAX_RESTARTS,
        }
    }
}

/// In-memory registration record; the Orchestrator is the sole owner of this
/// map, per the Ownership model.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub descriptor: Arc<AgentDescriptor>,
    pub status: AgentStatus,
    pub restart_count: u32,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub active_executions: u32,
}

/// A handle to one agent's running activation; dropping/cancelling it stops
/// the activation's background task(s).
pub struct ActivationHandle {
    pub cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ActivationHandle {
    /// Request a stop and wait up to `grace` for the activation to exit.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(grace, self.join).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent {name} is not registered")]
    NotRegistered { name: String },
    #[error("invalid transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    #[error(transparent)]
    Bus(#[from] crate::bus::DispatchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Map a descriptor's mode to its routing key, per the Orchestrator's
/// routing contract.
pub fn routing_key_for(descriptor: &AgentDescriptor) -> String {
    use conduit_db::models::AgentMode;
    match descriptor.mode {
        AgentMode::Autonomous => "autonomous.task.submitted".to_owned(),
        AgentMode::Collaborative => "collaborative.task.submitted".to_owned(),
        AgentMode::Continuous => format!("continuous.task.{}", descriptor.name),
        AgentMode::Scheduled => format!("scheduled.task.{}", descriptor.name),
    }
}

/// The Orchestrator: registry + health + routing.
pub struct Orchestrator {
    pool: Arc<PgPool>,
    registry: Arc<Registry>,
    bus: SharedDispatchBus,
    store: Arc<StateStore>,
    config: OrchestratorConfig,
    registrations: Arc<RwLock<HashMap<String, AgentRegistration>>>,
    activations: Arc<RwLock<HashMap<String, ActivationHandle>>>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<PgPool>,
        registry: Arc<Registry>,
        bus: SharedDispatchBus,
        store: Arc<StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            bus,
            store,
            config,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            activations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// REGISTERED -> STARTING -> HEALTHY|FAILED.
    ///
    /// Discipline activation itself (subscribing the continuous queue,
    /// registering the autonomous/collaborative consumer group, scheduling
    /// the cron ticker) is the caller's responsibility via `activation_fn`;
    /// the Orchestrator only owns the state transitions and bookkeeping
    /// around it, mirroring how each pool owns its own active executions.
    pub async fn activate<F, Fut>(
        &self,
        descriptor: Arc<AgentDescriptor>,
        activation_fn: F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = descriptor.name.clone();
        self.set_status(&name, descriptor.clone(), AgentStatus::Starting, 0)
            .await?;

        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let join = tokio::spawn(async move {
            if let Err(err) = activation_fn(cancel_for_task).await {
                warn!(agent = %name, %err, "activation failed");
            }
        });

        self.activations
            .write()
            .await
            .insert(descriptor.name.clone(), ActivationHandle { cancel, join });

        self.set_status(&descriptor.name, descriptor, AgentStatus::Healthy, 0)
            .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        name: &str,
        descriptor: Arc<AgentDescriptor>,
        status: AgentStatus,
        restart_count: u32,
    ) -> Result<(), OrchestratorError> {
        {
            let mut regs = self.registrations.write().await;
            let entry = regs.entry(name.to_owned()).or_insert_with(|| AgentRegistration {
                descriptor: descriptor.clone(),
                status: AgentStatus::Registered,
                restart_count: 0,
                last_heartbeat: None,
                active_executions: 0,
            });

            if entry.status != status && !is_valid_transition(entry.status, status) {
                return Err(OrchestratorError::InvalidTransition {
                    name: name.to_owned(),
                    from: entry.status,
                    to: status,
                });
            }
            entry.status = status;
            entry.restart_count = restart_count;
            entry.descriptor = descriptor;
        }

        registrations::upsert_registration(
            &self.pool,
            name,
            self.registrations
                .read()
                .await
                .get(name)
                .map(|r| r.descriptor.mode)
                .context("registration vanished mid-update")?,
            status,
        )
        .await
        .context("failed to persist registration status")?;

        Ok(())
    }

    pub async fn record_heartbeat(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut regs = self.registrations.write().await;
        let Some(entry) = regs.get_mut(name) else {
            return Err(OrchestratorError::NotRegistered { name: name.to_owned() });
        };
        entry.last_heartbeat = Some(chrono::Utc::now());
        if entry.status == AgentStatus::Degraded {
            entry.status = AgentStatus::Healthy;
        }
        drop(regs);
        registrations::record_heartbeat(&self.pool, name)
            .await
            .context("failed to persist heartbeat")?;
        Ok(())
    }

    /// One pass of the heartbeat supervisor: mark agents whose last
    /// heartbeat exceeds `heartbeat_timeout` as DEGRADED and schedule a
    /// restart; after `max_restarts` consecutive failures, mark FAILED.
    pub async fn supervise_once(&self) {
        let now = chrono::Utc::now();
        let stale: Vec<(String, Arc<AgentDescriptor>, u32)> = {
            let regs = self.registrations.read().await;
            regs.iter()
                .filter(|(_, r)| r.status == AgentStatus::Healthy)
                .filter(|(_, r)| {
                    r.last_heartbeat
                        .map(|hb| now.signed_duration_since(hb).to_std().unwrap_or_default() > self.config.heartbeat_timeout)
                        .unwrap_or(false)
                })
                .map(|(name, r)| (name.clone(), r.descriptor.clone(), r.restart_count))
                .collect()
        };

        for (name, descriptor, restart_count) in stale {
            warn!(agent = %name, "heartbeat missed, marking degraded");
            let _ = self.set_status(&name, descriptor.clone(), AgentStatus::Degraded, restart_count).await;

            if restart_count >= self.config.max_restarts {
                warn!(agent = %name, restart_count, "max restarts exhausted, marking failed");
                let _ = self.set_status(&name, descriptor, AgentStatus::Failed, restart_count).await;
            } else {
                info!(agent = %name, restart_count, "scheduling restart");
                let _ = registrations::increment_restart_count(&self.pool, &name).await;
            }
        }
    }

    /// Submit a task for `agent_name`: creates a QUEUED ExecutionRecord and
    /// publishes to the routing key matching the agent's mode.
    pub async fn submit(
        &self,
        agent_name: &str,
        payload: serde_json::Value,
        trace_id: Option<Uuid>,
    ) -> Result<Uuid, OrchestratorError> {
        let descriptor = self
            .registry
            .get(agent_name)
            .await
            .ok_or_else(|| OrchestratorError::NotRegistered { name: agent_name.to_owned() })?;

        let execution_id = Uuid::new_v4();
        let routing_key = routing_key_for(&descriptor);
        let mut event = TaskEvent::new(routing_key.clone(), payload);
        event.agent_name = Some(agent_name.to_owned());
        event.execution_id = Some(execution_id);
        if let Some(retry) = descriptor.retry_config() {
            event.max_retries = retry.max_retries;
        }
        if let Some(trace_id) = trace_id {
            event.trace_id = trace_id;
        }

        self.store
            .append_execution(execution_id, agent_name, event.trace_id)
            .await
            .context("failed to create queued execution record")?;

        self.bus.publish(&routing_key, event).await?;

        Ok(execution_id)
    }

    /// Operator cancel: mark a non-terminal execution CANCELLED.
    ///
    /// Returns `(cancelled, previous_status)`. No-op (returns `false`) if the
    /// execution is already in a terminal state or doesn't exist.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(bool, conduit_db::models::ExecutionStatus), OrchestratorError> {
        use conduit_db::models::ExecutionStatus;

        let record = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(|err| OrchestratorError::Other(anyhow::anyhow!(err)))?;

        if record.status.is_terminal() {
            return Ok((false, record.status));
        }

        self.store
            .complete_execution(execution_id, ExecutionStatus::Cancelled, None, Some("cancelled by operator"), 0)
            .await
            .map_err(|err| OrchestratorError::Other(anyhow::anyhow!(err)))?;

        Ok((true, record.status))
    }

    pub async fn registration(&self, name: &str) -> Option<AgentRegistration> {
        self.registrations.read().await.get(name).cloned()
    }

    pub async fn list_registrations(&self) -> Vec<AgentRegistration> {
        self.registrations.read().await.values().cloned().collect()
    }

    /// Broadcast stop to all activations, waiting up to `shutdown_grace` for
    /// in-flight executions to drain before cancelling remaining contexts.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ActivationHandle)> =
            self.activations.write().await.drain().collect();

        for (name, handle) in handles {
            info!(agent = %name, "stopping activation");
            handle.stop(self.config.shutdown_grace).await;
            let _ = registrations::set_status(&self.pool, &name, AgentStatus::Stopped).await;
        }

        let mut regs = self.registrations.write().await;
        for reg in regs.values_mut() {
            reg.status = AgentStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_db::models::AgentMode;
    use crate::descriptor::{DisciplineConfig, LlmConfig, RetryConfig};

    fn descriptor(mode: AgentMode) -> Arc<AgentDescriptor> {
        Arc::new(AgentDescriptor {
            name: "echo-agent".to_owned(),
            mode,
            system_prompt: "hi".to_owned(),
            llm: LlmConfig {
                provider: "openai".to_owned(),
                model: "gpt-4".to_owned(),
                temperature: None,
                max_tokens: None,
                credentials: Default::default(),
            },
            tools: vec![],
            subscriptions: vec![],
            tags: vec![],
            discipline: DisciplineConfig::Autonomous(RetryConfig::default()),
        })
    }

    #[test]
    fn routing_key_matches_mode() {
        assert_eq!(routing_key_for(&descriptor(AgentMode::Autonomous)), "autonomous.task.submitted");
        assert_eq!(routing_key_for(&descriptor(AgentMode::Collaborative)), "collaborative.task.submitted");
        assert_eq!(routing_key_for(&descriptor(AgentMode::Continuous)), "continuous.task.echo-agent");
        assert_eq!(routing_key_for(&descriptor(AgentMode::Scheduled)), "scheduled.task.echo-agent");
    }
}
