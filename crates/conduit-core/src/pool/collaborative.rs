//! Collaborative Pool (C7): multi-step plans sequenced across executor
//! agents, with clarification suspend/resume.

use std::sync::Arc;
use std::time::Duration;

use conduit_db::models::PlanStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{DeliveredEvent, SharedDispatchBus, SubscribeOptions};
use crate::event::{HandlerOutcome, TaskEvent};
use crate::orchestrator::routing_key_for;
use crate::provider::{CompletionMessage, CompletionRequest, ProviderError, ProviderRegistry};
use crate::registry::Registry;
use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    WaitingClarification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_index: usize,
    pub executor_agent: String,
    pub prompt: String,
    pub execution_id: Option<Uuid>,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
}

/// The full plan state blob, persisted as one JSON value via
/// `StateStore::save_plan` rather than normalized into per-step rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRunState {
    pub task_id: Uuid,
    pub trace_id: Uuid,
    pub steps: Vec<PlanStep>,
    pub aggregated_result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    executor_agent: String,
    prompt: String,
}

#[derive(Debug, Clone)]
pub struct CollaborativePoolConfig {
    pub max_plan_steps: usize,
    pub step_timeout: Duration,
    pub clarification_timeout: Duration,
}

impl Default for CollaborativePoolConfig {
    fn default() -> Self {
        Self {
            max_plan_steps: 10,
            step_timeout: Duration::from_secs(300),
            clarification_timeout: Duration::from_secs(300),
        }
    }
}

pub struct CollaborativePool {
    bus: SharedDispatchBus,
    store: Arc<StateStore>,
    providers: Arc<ProviderRegistry>,
    registry: Arc<Registry>,
    config: CollaborativePoolConfig,
    completions: broadcast::Sender<TaskEvent>,
}

impl CollaborativePool {
    pub fn new(
        bus: SharedDispatchBus,
        store: Arc<StateStore>,
        providers: Arc<ProviderRegistry>,
        registry: Arc<Registry>,
        config: CollaborativePoolConfig,
    ) -> Self {
        let (completions, _) = broadcast::channel(256);
        Self {
            bus,
            store,
            providers,
            registry,
            config,
            completions,
        }
    }

    /// Run both subscriptions (plan submission, and the `*.task.completed`
    /// fan-out tap step completions wait on) until `cancel` fires.
    ///
    /// Submission and clarification handling run a whole plan to completion
    /// via `run_from`, which blocks on the `completions` broadcast — fed
    /// only by this same loop's completions-tap arm. Running either inline
    /// would starve that arm for the life of the plan, so each is spawned
    /// onto its own task and the loop keeps draining all three
    /// subscriptions concurrently.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut submissions = self
            .bus
            .subscribe(
                "pool.collaborative",
                SubscribeOptions {
                    patterns: vec!["collaborative.task.submitted".to_owned()],
                    prefetch: 1,
                    enable_dlq: true,
                    max_retries: 1,
                },
            )
            .await?;

        let mut completions_tap = self
            .bus
            .subscribe(
                "pool.collaborative.completions",
                SubscribeOptions {
                    patterns: vec!["*.task.completed".to_owned()],
                    prefetch: 16,
                    enable_dlq: false,
                    max_retries: 0,
                },
            )
            .await?;

        let mut clarifications = self
            .bus
            .subscribe(
                "pool.collaborative.clarifications",
                SubscribeOptions {
                    patterns: vec!["collaborative.clarification.provided".to_owned()],
                    prefetch: 1,
                    enable_dlq: false,
                    max_retries: 0,
                },
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("collaborative pool shutting down");
                    return Ok(());
                }
                delivered = submissions.receiver.recv() => {
                    let Some(delivered) = delivered else { return Ok(()); };
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.handle_submission(delivered).await;
                    });
                }
                delivered = completions_tap.receiver.recv() => {
                    let Some(delivered) = delivered else { return Ok(()); };
                    let _ = self.completions.send(delivered.event.clone());
                    delivered.ack().await;
                }
                delivered = clarifications.receiver.recv() => {
                    let Some(delivered) = delivered else { return Ok(()); };
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.handle_clarification(&delivered.event).await;
                        delivered.ack().await;
                    });
                }
            }
        }
    }

    async fn handle_submission(&self, delivered: DeliveredEvent) {
        let outcome = self.start_plan(&delivered.event).await;
        match outcome {
            HandlerOutcome::Ack => delivered.ack().await,
            HandlerOutcome::Retryable(err) => {
                warn!(%err, "collaborative plan creation failed transiently");
                delivered.retry().await;
            }
            HandlerOutcome::Fatal(err) => {
                warn!(%err, "collaborative plan creation failed permanently");
                delivered.fatal(err.to_string()).await;
            }
        }
    }

    /// Steps 1-3: create the plan, invoke the planner, persist RUNNING.
    async fn start_plan(&self, event: &TaskEvent) -> HandlerOutcome {
        let task_id = event.execution_id.unwrap_or_else(Uuid::new_v4);

        let Some(agent_name) = event.agent_name.as_deref() else {
            return HandlerOutcome::Fatal(anyhow::anyhow!("event carries no agent_name"));
        };
        let Some(descriptor) = self.registry.get(agent_name).await else {
            return HandlerOutcome::Fatal(anyhow::anyhow!("unknown agent {agent_name}"));
        };
        let Some(provider) = self.providers.get(&descriptor.llm.provider) else {
            return HandlerOutcome::Fatal(anyhow::anyhow!("unknown provider {}", descriptor.llm.provider));
        };
        let collaborative_config = descriptor.collaborative_config().cloned().unwrap_or_default();
        let max_plan_steps = collaborative_config.max_plan_steps.min(self.config.max_plan_steps);

        let prompt = event.payload.get("prompt").and_then(|v| v.as_str()).unwrap_or_default();
        let request = CompletionRequest {
            model: descriptor.llm.model.clone(),
            system_prompt: format!(
                "{} Decompose the task into an ordered JSON array of steps, each \
                 {{\"executor_agent\": <name>, \"prompt\": <text>}}, selecting executors from: {}.",
                descriptor.system_prompt,
                collaborative_config.preferred_collaborators.join(", "),
            ),
            messages: vec![CompletionMessage {
                role: "user".to_owned(),
                content: prompt.to_owned(),
            }],
            temperature: descriptor.llm.temperature,
            max_tokens: descriptor.llm.max_tokens,
        };

        let response = match provider.complete(request).await {
            Ok(response) => response,
            Err(ProviderError::Transient(err)) => return HandlerOutcome::Retryable(err),
            Err(ProviderError::Permanent(err)) => return HandlerOutcome::Fatal(err),
        };

        let planned: Vec<PlannedStep> = match serde_json::from_str(&response.content) {
            Ok(steps) => steps,
            Err(err) => return HandlerOutcome::Fatal(anyhow::anyhow!("planner response was not a valid step list: {err}")),
        };

        if planned.is_empty() {
            return HandlerOutcome::Fatal(anyhow::anyhow!("planner returned no steps"));
        }
        if planned.len() > max_plan_steps {
            return HandlerOutcome::Fatal(anyhow::anyhow!(
                "plan has {} steps, exceeding max_plan_steps={}",
                planned.len(),
                max_plan_steps
            ));
        }

        let steps = planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| PlanStep {
                step_index: i,
                executor_agent: p.executor_agent,
                prompt: p.prompt,
                execution_id: None,
                status: StepStatus::Pending,
                result: None,
            })
            .collect();

        let plan = PlanRunState {
            task_id,
            trace_id: event.trace_id,
            steps,
            aggregated_result: None,
        };

        if let Err(err) = self.persist(&plan, PlanStatus::Running, 0).await {
            return HandlerOutcome::Fatal(err);
        }

        self.run_from(plan, 0).await
    }

    async fn handle_clarification(&self, event: &TaskEvent) {
        let Some(task_id) = event.payload.get("task_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<Uuid>().ok()) else {
            warn!("clarification event missing task_id");
            return;
        };

        let plan_row = match self.store.get_plan(task_id).await {
            Ok(Some(row)) if row.status == PlanStatus::WaitingClarification => row,
            Ok(_) => return,
            Err(err) => {
                warn!(%err, "failed to load plan awaiting clarification");
                return;
            }
        };

        let mut plan: PlanRunState = match serde_json::from_value(plan_row.plan) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "failed to deserialize waiting plan");
                return;
            }
        };

        let resume_step = plan_row.current_step as usize;
        if let Some(step) = plan.steps.get_mut(resume_step) {
            step.status = StepStatus::Completed;
            step.result = event.payload.get("reply").cloned();
        }

        self.run_from(plan, resume_step + 1).await;
    }

    /// Steps 4-5: execute steps `from_step..` in order, persisting progress
    /// and either suspending for clarification or completing/failing the
    /// plan.
    async fn run_from(&self, mut plan: PlanRunState, from_step: usize) -> HandlerOutcome {
        for idx in from_step..plan.steps.len() {
            let routing_key = match self.registry.get(&plan.steps[idx].executor_agent).await {
                Some(descriptor) => routing_key_for(&descriptor),
                None => {
                    warn!(agent = %plan.steps[idx].executor_agent, "plan references unknown executor agent");
                    let _ = self.persist(&plan, PlanStatus::Failed, idx as i32).await;
                    return HandlerOutcome::Fatal(anyhow::anyhow!("unknown executor agent {}", plan.steps[idx].executor_agent));
                }
            };

            let execution_id = Uuid::new_v4();
            plan.steps[idx].execution_id = Some(execution_id);

            let step_event = TaskEvent {
                event_id: Uuid::new_v4(),
                event_type: routing_key.clone(),
                timestamp: chrono::Utc::now(),
                trace_id: plan.trace_id,
                parent_event_id: None,
                priority: 0,
                retry_count: 0,
                max_retries: 0,
                payload: serde_json::json!({
                    "task_id": plan.task_id,
                    "prompt": plan.steps[idx].prompt,
                }),
                agent_name: Some(plan.steps[idx].executor_agent.clone()),
                execution_id: Some(execution_id),
            };

            if let Err(err) = self.bus.publish(&routing_key, step_event).await {
                let _ = self.persist(&plan, PlanStatus::Failed, idx as i32).await;
                return HandlerOutcome::Fatal(err.into());
            }

            let mut rx = self.completions.subscribe();
            let completed = tokio::time::timeout(self.config.step_timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.execution_id == Some(execution_id) => return Some(event),
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                }
            })
            .await;

            let step_result = match completed {
                Ok(Some(event)) => event.payload,
                Ok(None) => {
                    let _ = self.persist(&plan, PlanStatus::Failed, idx as i32).await;
                    return HandlerOutcome::Fatal(anyhow::anyhow!("completion broadcast closed mid-plan"));
                }
                Err(_) => {
                    let _ = self.persist(&plan, PlanStatus::Failed, idx as i32).await;
                    return HandlerOutcome::Fatal(anyhow::anyhow!(
                        "step {idx} for {} timed out after {:?}",
                        plan.steps[idx].executor_agent,
                        self.config.step_timeout
                    ));
                }
            };

            if step_result.get("clarification_requested").and_then(|v| v.as_bool()).unwrap_or(false) {
                plan.steps[idx].status = StepStatus::WaitingClarification;
                plan.steps[idx].result = Some(step_result);
                if let Err(err) = self.persist(&plan, PlanStatus::WaitingClarification, idx as i32).await {
                    return HandlerOutcome::Fatal(err);
                }
                return HandlerOutcome::Ack;
            }

            plan.steps[idx].status = StepStatus::Completed;
            plan.steps[idx].result = Some(step_result);
            if let Err(err) = self.persist(&plan, PlanStatus::Running, idx as i32).await {
                return HandlerOutcome::Fatal(err);
            }
        }

        plan.aggregated_result = Some(aggregate_results(&plan.steps));
        let last_step = plan.steps.len().saturating_sub(1) as i32;
        if let Err(err) = self.persist(&plan, PlanStatus::Completed, last_step).await {
            return HandlerOutcome::Fatal(err);
        }

        let completed_event = TaskEvent::new(
            "collaborative.task.completed",
            serde_json::json!({
                "task_id": plan.task_id,
                "aggregated_result": plan.aggregated_result,
            }),
        );
        if let Err(err) = self.bus.publish("collaborative.task.completed", completed_event).await {
            warn!(%err, "failed to publish collaborative.task.completed");
        }

        HandlerOutcome::Ack
    }

    async fn persist(&self, plan: &PlanRunState, status: PlanStatus, current_step: i32) -> Result<(), anyhow::Error> {
        let value = serde_json::to_value(plan)?;
        self.store.save_plan(plan.task_id, value, current_step, status).await?;
        Ok(())
    }

    /// Background scan failing any plan that has waited past
    /// `clarification_timeout` without a reply.
    pub async fn run_clarification_timeouts(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => self.fail_stale_clarifications().await,
            }
        }
    }

    async fn fail_stale_clarifications(&self) {
        let Ok(active) = self.store.list_active_plans().await else {
            return;
        };
        let now = chrono::Utc::now();
        for row in active {
            if row.status != PlanStatus::WaitingClarification {
                continue;
            }
            let age = now.signed_duration_since(row.updated_at).to_std().unwrap_or_default();
            if age > self.config.clarification_timeout {
                warn!(task_id = %row.task_id, "clarification timed out, failing plan");
                let _ = self.store.save_plan(row.task_id, row.plan, row.current_step, PlanStatus::Failed).await;
                let failed_event = TaskEvent::new(
                    "collaborative.task.failed",
                    serde_json::json!({ "task_id": row.task_id, "reason": "clarification_timeout" }),
                );
                let _ = self.bus.publish("collaborative.task.failed", failed_event).await;
            }
        }
    }
}

/// Fold per-step results into one aggregated JSON value, ordered by
/// `step_index`.
pub fn aggregate_results(steps: &[PlanStep]) -> serde_json::Value {
    let mut ordered: Vec<&PlanStep> = steps.iter().collect();
    ordered.sort_by_key(|s| s.step_index);
    serde_json::json!({
        "steps": ordered
            .iter()
            .map(|s| serde_json::json!({
                "step_index": s.step_index,
                "executor_agent": s.executor_agent,
                "result": s.result,
            }))
            .collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(idx: usize, result: serde_json::Value) -> PlanStep {
        PlanStep {
            step_index: idx,
            executor_agent: format!("agent-{idx}"),
            prompt: String::new(),
            execution_id: None,
            status: StepStatus::Completed,
            result: Some(result),
        }
    }

    #[test]
    fn aggregate_preserves_step_order() {
        let steps = vec![
            step(1, serde_json::json!("second")),
            step(0, serde_json::json!("first")),
        ];
        let aggregated = aggregate_results(&steps);
        let ordered = aggregated["steps"].as_array().unwrap();
        assert_eq!(ordered[0]["result"], "first");
        assert_eq!(ordered[1]["result"], "second");
    }
}
