//! Scheduler contract boundary (ambient): emits `scheduled.task.<name>`
//! events on a cron or interval cadence. Specified only at the boundary — no
//! persistence or leader election; a single orchestrator process owns every
//! ticker.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{SharedDispatchBus, SubscribeOptions};
use crate::descriptor::{AgentDescriptor, ScheduleConfig};
use crate::event::TaskEvent;
use crate::orchestrator::Orchestrator;
use conduit_db::models::ExecutionStatus;

use crate::state_store::StateStore;

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    store: Arc<StateStore>,
    bus: SharedDispatchBus,
    completions: broadcast::Sender<TaskEvent>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<StateStore>, bus: SharedDispatchBus) -> Self {
        let (completions, _) = broadcast::channel(256);
        Self {
            orchestrator,
            store,
            bus,
            completions,
        }
    }

    /// Shared `*.task.completed` fan-out tap every ticker's timeout wait
    /// listens on. Started once per process, mirroring the Collaborative
    /// Pool's completion tap.
    pub async fn run_completion_tap(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut handle = self
            .bus
            .subscribe(
                "scheduler.completions",
                SubscribeOptions {
                    patterns: vec!["*.task.completed".to_owned()],
                    prefetch: 16,
                    enable_dlq: false,
                    max_retries: 0,
                },
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = handle.receiver.recv() => {
                    let Some(delivered) = delivered else { return Ok(()); };
                    let _ = self.completions.send(delivered.event.clone());
                    delivered.ack().await;
                }
            }
        }
    }

    /// Run the ticker for one SCHEDULED descriptor until `cancel` fires.
    pub async fn run(&self, descriptor: Arc<AgentDescriptor>, cancel: CancellationToken) -> anyhow::Result<()> {
        let schedule_config = descriptor
            .schedule_config()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} is not a SCHEDULED descriptor", descriptor.name))?;

        match (&schedule_config.cron, schedule_config.interval_seconds) {
            (Some(expr), _) => self.run_cron(&descriptor, expr, &schedule_config, cancel).await,
            (None, Some(secs)) => self.run_interval(&descriptor, Duration::from_secs(secs), &schedule_config, cancel).await,
            (None, None) => Err(anyhow::anyhow!(
                "{} schedule_config has neither cron nor interval_seconds",
                descriptor.name
            )),
        }
    }

    async fn run_interval(
        &self,
        descriptor: &AgentDescriptor,
        period: Duration,
        schedule_config: &ScheduleConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(agent = %descriptor.name, "scheduler ticker shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick_once(descriptor, schedule_config).await;
                }
            }
        }
    }

    /// `timezone` is accepted on the descriptor but every cadence is
    /// evaluated in UTC: the corpus carries no timezone-database crate, and
    /// adding one isn't justified by this single field.
    async fn run_cron(
        &self,
        descriptor: &AgentDescriptor,
        expr: &str,
        schedule_config: &ScheduleConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(expr)
            .map_err(|err| anyhow::anyhow!("invalid cron expression {expr:?} for {}: {err}", descriptor.name))?;

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                return Err(anyhow::anyhow!("cron schedule for {} has no upcoming occurrence", descriptor.name));
            };
            let delay = next.signed_duration_since(Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(agent = %descriptor.name, "scheduler ticker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {
                    self.tick_once(descriptor, schedule_config).await;
                }
            }
        }
    }

    async fn tick_once(&self, descriptor: &AgentDescriptor, schedule_config: &ScheduleConfig) {
        let payload = schedule_config.task_data.clone().unwrap_or_else(|| serde_json::json!({}));
        let execution_id = match self.orchestrator.submit(&descriptor.name, payload, None).await {
            Ok(id) => id,
            Err(err) => {
                warn!(agent = %descriptor.name, %err, "scheduled submit failed");
                return;
            }
        };

        let timeout = Duration::from_secs(schedule_config.timeout_seconds);
        let mut rx = self.completions.subscribe();
        let timed_out = !matches!(
            tokio::time::timeout(timeout, wait_for(&mut rx, execution_id)).await,
            Ok(true)
        );

        if timed_out {
            warn!(agent = %descriptor.name, %execution_id, "scheduled task timed out");
            let topic = format!("scheduled.task.{}.timeout", descriptor.name);
            let timeout_event = TaskEvent::new(topic.clone(), serde_json::json!({ "execution_id": execution_id }));
            if let Err(err) = self.bus.publish(&topic, timeout_event).await {
                warn!(%err, "failed to publish scheduled timeout event");
            }
            let _ = self
                .store
                .complete_execution(execution_id, ExecutionStatus::Timeout, None, Some("timed out"), 0)
                .await;
        }
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<TaskEvent>, execution_id: Uuid) -> bool {
    loop {
        match rx.recv().await {
            Ok(event) if event.execution_id == Some(execution_id) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cron_expression_is_rejected() {
        assert!(Schedule::from_str("not a cron expression").is_err());
    }

    #[test]
    fn valid_cron_expression_has_upcoming_occurrence() {
        let schedule = Schedule::from_str("0 */5 * * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }
}
