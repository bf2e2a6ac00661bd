//! Agent descriptors: the immutable, on-disk definition of an agent.
//!
//! A descriptor is parsed from YAML by [`DescriptorFile`], then validated into
//! the invariant-checked [`AgentDescriptor`] domain type via [`TryFrom`]. Only
//! the validated type is ever handed to the rest of the system.

mod validate;

use std::collections::HashMap;

use conduit_db::models::AgentMode;
use serde::{Deserialize, Serialize};

pub use validate::DescriptorError;

/// LLM provider/model selection for a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Secrets injected by the Configuration Registry's provider table.
    /// Populated after load; never present in the on-disk YAML.
    #[serde(default, skip_serializing)]
    pub credentials: HashMap<String, String>,
}

/// A tool an agent may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
}

/// `retry_config` block (AUTONOMOUS descriptors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "RetryConfig::default_exponential_backoff")]
    pub exponential_backoff: bool,
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        2
    }
    const fn default_retry_delay_seconds() -> u64 {
        1
    }
    const fn default_exponential_backoff() -> bool {
        true
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_delay_seconds: Self::default_retry_delay_seconds(),
            exponential_backoff: Self::default_exponential_backoff(),
        }
    }
}

/// `continuous_config` block (CONTINUOUS descriptors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousConfig {
    #[serde(default = "ContinuousConfig::default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "ContinuousConfig::default_save_interval_seconds")]
    pub save_interval_seconds: u64,
    #[serde(default = "ContinuousConfig::default_max_conversation_history")]
    pub max_conversation_history: usize,
}

impl ContinuousConfig {
    const fn default_idle_timeout_seconds() -> u64 {
        900
    }
    const fn default_save_interval_seconds() -> u64 {
        30
    }
    const fn default_max_conversation_history() -> usize {
        50
    }
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: Self::default_idle_timeout_seconds(),
            save_interval_seconds: Self::default_save_interval_seconds(),
            max_conversation_history: Self::default_max_conversation_history(),
        }
    }
}

/// `collaborative_config` block (COLLABORATIVE descriptors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeConfig {
    #[serde(default)]
    pub preferred_collaborators: Vec<String>,
    #[serde(default = "CollaborativeConfig::default_max_plan_steps")]
    pub max_plan_steps: usize,
    #[serde(default = "CollaborativeConfig::default_allow_human_clarification")]
    pub allow_human_clarification: bool,
    #[serde(default = "CollaborativeConfig::default_clarification_timeout_seconds")]
    pub clarification_timeout_seconds: u64,
}

impl CollaborativeConfig {
    const fn default_max_plan_steps() -> usize {
        10
    }
    const fn default_allow_human_clarification() -> bool {
        true
    }
    const fn default_clarification_timeout_seconds() -> u64 {
        300
    }
}

impl Default for CollaborativeConfig {
    fn default() -> Self {
        Self {
            preferred_collaborators: Vec::new(),
            max_plan_steps: Self::default_max_plan_steps(),
            allow_human_clarification: Self::default_allow_human_clarification(),
            clarification_timeout_seconds: Self::default_clarification_timeout_seconds(),
        }
    }
}

/// `schedule_config` block (SCHEDULED descriptors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub task_data: Option<serde_json::Value>,
    #[serde(default = "ScheduleConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ScheduleConfig {
    const fn default_timeout_seconds() -> u64 {
        300
    }
}

/// The raw, unvalidated shape of a descriptor YAML file.
///
/// Every discipline-specific block is optional at the parse layer; exactly-one
/// validation happens in [`TryFrom<DescriptorFile>`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorFile {
    pub name: String,
    pub mode: AgentMode,
    pub llm: LlmConfig,
    pub system_prompt: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    #[serde(default)]
    pub continuous_config: Option<ContinuousConfig>,
    #[serde(default)]
    pub collaborative_config: Option<CollaborativeConfig>,
    #[serde(default)]
    pub schedule_config: Option<ScheduleConfig>,
}

/// The discipline-specific block of a validated descriptor; exactly one
/// variant is ever populated, enforced at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DisciplineConfig {
    Autonomous(RetryConfig),
    Collaborative(CollaborativeConfig),
    Continuous(ContinuousConfig),
    Scheduled(ScheduleConfig),
}

/// An immutable, validated agent descriptor.
///
/// Constructed only via [`AgentDescriptor::try_from_file`]; the invariants in
/// the name regex and discipline-block exclusivity are enforced there, so any
/// live `AgentDescriptor` is known-valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub mode: AgentMode,
    pub system_prompt: String,
    pub llm: LlmConfig,
    pub tools: Vec<ToolConfig>,
    pub subscriptions: Vec<String>,
    pub tags: Vec<String>,
    pub discipline: DisciplineConfig,
}

impl AgentDescriptor {
    /// Validate a parsed [`DescriptorFile`] into a domain descriptor.
    pub fn try_from_file(file: DescriptorFile) -> Result<Self, DescriptorError> {
        validate::validate(file)
    }

    pub fn retry_config(&self) -> Option<&RetryConfig> {
        match &self.discipline {
            DisciplineConfig::Autonomous(c) => Some(c),
            _ => None,
        }
    }

    pub fn continuous_config(&self) -> Option<&ContinuousConfig> {
        match &self.discipline {
            DisciplineConfig::Continuous(c) => Some(c),
            _ => None,
        }
    }

    pub fn collaborative_config(&self) -> Option<&CollaborativeConfig> {
        match &self.discipline {
            DisciplineConfig::Collaborative(c) => Some(c),
            _ => None,
        }
    }

    pub fn schedule_config(&self) -> Option<&ScheduleConfig> {
        match &self.discipline {
            DisciplineConfig::Scheduled(c) => Some(c),
            _ => None,
        }
    }
}
