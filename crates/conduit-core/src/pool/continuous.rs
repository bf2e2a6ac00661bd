//! Continuous Runner (C6): one serialized queue per CONTINUOUS agent, backed
//! by an in-memory cache of conversation state with idle-flush eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{DeliveredEvent, SharedDispatchBus, SubscribeOptions};
use crate::descriptor::AgentDescriptor;
use crate::event::{HandlerOutcome, TaskEvent};
use crate::provider::{CompletionMessage, CompletionRequest, ProviderError, ProviderRegistry};
use crate::state_store::StateStore;

/// Bounded retries for a `StaleVersion` save conflict before the turn is
/// treated as a fatal failure.
const SAVE_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// The per-agent conversation/memory blob persisted via
/// `StateStore::save_continuous`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContinuousAgentState {
    pub conversation: Vec<ConversationTurn>,
    pub event_count: u64,
}

struct CachedState {
    state: ContinuousAgentState,
    version: i64,
    dirty: bool,
    last_activity: Instant,
    last_save: Instant,
}

#[derive(Debug, Clone)]
pub struct ContinuousRunnerConfig {
    pub idle_timeout: Duration,
    pub idle_scan_interval: Duration,
}

impl Default for ContinuousRunnerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            idle_scan_interval: Duration::from_secs(60),
        }
    }
}

pub struct ContinuousRunner {
    bus: SharedDispatchBus,
    store: Arc<StateStore>,
    providers: Arc<ProviderRegistry>,
    cache: Arc<Mutex<HashMap<String, CachedState>>>,
    config: ContinuousRunnerConfig,
}

impl ContinuousRunner {
    pub fn new(
        bus: SharedDispatchBus,
        store: Arc<StateStore>,
        providers: Arc<ProviderRegistry>,
        config: ContinuousRunnerConfig,
    ) -> Self {
        Self {
            bus,
            store,
            providers,
            cache: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Run the single `continuous.task.<name>` subscription for `descriptor`
    /// until `cancel` fires. Crash recovery needs no special path: the cache
    /// starts empty and the per-event load step (cache miss -> durable
    /// store -> fresh state) reconstructs whatever existed before a restart.
    pub async fn run(&self, descriptor: Arc<AgentDescriptor>, cancel: CancellationToken) -> anyhow::Result<()> {
        let routing_key = format!("continuous.task.{}", descriptor.name);
        let queue_name = format!("continuous.{}", descriptor.name);
        let mut handle = self
            .bus
            .subscribe(
                &queue_name,
                SubscribeOptions {
                    patterns: vec![routing_key],
                    prefetch: 1,
                    enable_dlq: true,
                    max_retries: 3,
                },
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(agent = %descriptor.name, "continuous runner shutting down");
                    return Ok(());
                }
                delivered = handle.receiver.recv() => {
                    let Some(delivered) = delivered else {
                        return Ok(());
                    };
                    self.handle_delivery(&descriptor, delivered).await;
                }
            }
        }
    }

    async fn handle_delivery(&self, descriptor: &AgentDescriptor, delivered: DeliveredEvent) {
        let outcome = self.handle_continuous_event(descriptor, &delivered.event).await;
        match outcome {
            HandlerOutcome::Ack => delivered.ack().await,
            HandlerOutcome::Retryable(err) => {
                warn!(agent = %descriptor.name, %err, "continuous event failed transiently");
                delivered.retry().await;
            }
            HandlerOutcome::Fatal(err) => {
                warn!(agent = %descriptor.name, %err, "continuous event failed permanently");
                delivered.fatal(err.to_string()).await;
            }
        }
    }

    async fn handle_continuous_event(&self, descriptor: &AgentDescriptor, event: &TaskEvent) -> HandlerOutcome {
        let continuous_config = descriptor
            .continuous_config()
            .cloned()
            .unwrap_or_default();

        if let Err(err) = self.load_if_absent(&descriptor.name).await {
            return HandlerOutcome::Retryable(err);
        }

        let inbound = event
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        let Some(provider) = self.providers.get(&descriptor.llm.provider) else {
            return HandlerOutcome::Fatal(anyhow::anyhow!("unknown provider {}", descriptor.llm.provider));
        };

        let reply = {
            let mut cache = self.cache.lock().await;
            let cached = cache.get_mut(&descriptor.name).expect("loaded above");
            cached.state.conversation.push(ConversationTurn {
                role: "user".to_owned(),
                content: inbound,
            });
            prune_conversation(&mut cached.state.conversation, continuous_config.max_conversation_history);

            let messages = cached
                .state
                .conversation
                .iter()
                .map(|turn| CompletionMessage {
                    role: turn.role.clone(),
                    content: turn.content.clone(),
                })
                .collect();

            drop(cache);

            let request = CompletionRequest {
                model: descriptor.llm.model.clone(),
                system_prompt: descriptor.system_prompt.clone(),
                messages,
                temperature: descriptor.llm.temperature,
                max_tokens: descriptor.llm.max_tokens,
            };

            match provider.complete(request).await {
                Ok(response) => response.content,
                Err(ProviderError::Transient(err)) => return HandlerOutcome::Retryable(err),
                Err(ProviderError::Permanent(err)) => return HandlerOutcome::Fatal(err),
            }
        };

        {
            let mut cache = self.cache.lock().await;
            let cached = cache.get_mut(&descriptor.name).expect("loaded above");
            cached.state.conversation.push(ConversationTurn {
                role: "assistant".to_owned(),
                content: reply.clone(),
            });
            prune_conversation(&mut cached.state.conversation, continuous_config.max_conversation_history);
            cached.state.event_count += 1;
            cached.last_activity = Instant::now();
            cached.dirty = true;
        }

        let save_interval = Duration::from_secs(continuous_config.save_interval_seconds);
        if let Err(err) = self.maybe_save(&descriptor.name, save_interval).await {
            return HandlerOutcome::Fatal(err);
        }

        let result_event = event.derive(
            format!("continuous.result.{}", descriptor.name),
            serde_json::json!({ "reply": reply }),
        );
        if let Err(err) = self.bus.publish(&format!("continuous.result.{}", descriptor.name), result_event).await {
            warn!(agent = %descriptor.name, %err, "failed to publish continuous result");
        }

        HandlerOutcome::Ack
    }

    /// Load `name`'s state into the cache if it isn't already resident:
    /// durable store on a miss, fresh state if the durable store has
    /// nothing either.
    async fn load_if_absent(&self, name: &str) -> Result<(), anyhow::Error> {
        if self.cache.lock().await.contains_key(name) {
            return Ok(());
        }

        let (state, version) = match self.store.get_continuous(name).await? {
            Some((value, version)) => {
                let state: ContinuousAgentState = serde_json::from_value(value)?;
                (state, version)
            }
            None => (ContinuousAgentState::default(), 0),
        };

        self.cache.lock().await.insert(
            name.to_owned(),
            CachedState {
                state,
                version,
                dirty: false,
                last_activity: Instant::now(),
                last_save: Instant::now(),
            },
        );
        Ok(())
    }

    /// Save iff `save_interval` has elapsed since the last save, retrying up
    /// to [`SAVE_RETRY_ATTEMPTS`] on a version conflict by reloading the
    /// durable row and re-applying this turn's state on top of it.
    async fn maybe_save(&self, name: &str, save_interval: Duration) -> Result<(), anyhow::Error> {
        let due = {
            let cache = self.cache.lock().await;
            let cached = cache.get(name).expect("loaded above");
            cached.dirty && cached.last_save.elapsed() >= save_interval
        };
        if !due {
            return Ok(());
        }

        for attempt in 0..SAVE_RETRY_ATTEMPTS {
            let (state, expected_version) = {
                let cache = self.cache.lock().await;
                let cached = cache.get(name).expect("loaded above");
                (cached.state.clone(), cached.version)
            };
            let value = serde_json::to_value(&state)?;

            match self.store.save_continuous(name, &value, expected_version).await {
                Ok(()) => {
                    let mut cache = self.cache.lock().await;
                    let cached = cache.get_mut(name).expect("loaded above");
                    cached.version = expected_version + 1;
                    cached.dirty = false;
                    cached.last_save = Instant::now();
                    return Ok(());
                }
                Err(crate::state_store::StateStoreError::StaleVersion { actual, .. }) => {
                    warn!(agent = name, attempt, actual, "continuous save hit stale version, reloading");
                    if let Some((reloaded, version)) = self.store.get_continuous(name).await? {
                        let reloaded: ContinuousAgentState = serde_json::from_value(reloaded)?;
                        let mut cache = self.cache.lock().await;
                        let cached = cache.get_mut(name).expect("loaded above");
                        cached.state = reloaded;
                        cached.version = version;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(anyhow::anyhow!("exhausted {SAVE_RETRY_ATTEMPTS} save retries for continuous agent {name}"))
    }

    /// Scan the cache every `idle_scan_interval`, flushing and evicting any
    /// agent whose `last_activity` has aged past `idle_timeout`. Started
    /// once per process; shared across every activated continuous agent.
    pub async fn run_idle_flush(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config.idle_scan_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => self.flush_idle_once().await,
            }
        }
    }

    async fn flush_idle_once(&self) {
        let idle: Vec<String> = {
            let cache = self.cache.lock().await;
            cache
                .iter()
                .filter(|(_, cached)| cached.last_activity.elapsed() > self.config.idle_timeout)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in idle {
            let dirty = {
                let cache = self.cache.lock().await;
                cache.get(&name).map(|c| c.dirty).unwrap_or(false)
            };
            if dirty {
                if let Err(err) = self.maybe_save(&name, Duration::ZERO).await {
                    warn!(agent = %name, %err, "failed to flush idle continuous state");
                    continue;
                }
            }
            self.cache.lock().await.remove(&name);
            info!(agent = %name, "evicted idle continuous agent from cache");
        }
    }

}

/// Drop the oldest turns first once the conversation exceeds `max_len`.
fn prune_conversation(conversation: &mut Vec<ConversationTurn>, max_len: usize) {
    if conversation.len() > max_len {
        let excess = conversation.len() - max_len;
        conversation.drain(0..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_drops_oldest_first() {
        let mut conversation: Vec<ConversationTurn> = (0..5)
            .map(|i| ConversationTurn {
                role: "user".to_owned(),
                content: i.to_string(),
            })
            .collect();
        prune_conversation(&mut conversation, 3);
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[0].content, "2");
    }

    #[test]
    fn prune_is_noop_under_limit() {
        let mut conversation = vec![ConversationTurn {
            role: "user".to_owned(),
            content: "hi".to_owned(),
        }];
        prune_conversation(&mut conversation, 10);
        assert_eq!(conversation.len(), 1);
    }
}
