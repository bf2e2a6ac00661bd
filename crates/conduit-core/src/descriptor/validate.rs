use std::fmt;

use conduit_db::models::AgentMode;

use super::{AgentDescriptor, DescriptorFile, DisciplineConfig};

/// Errors raised while validating a parsed [`DescriptorFile`].
#[derive(Debug, Clone)]
pub enum DescriptorError {
    InvalidName(String),
    MissingDisciplineBlock { mode: AgentMode },
    ConflictingDisciplineBlocks { mode: AgentMode, found: Vec<&'static str> },
    ScheduleMissingTrigger,
    ScheduleAmbiguousTrigger,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(
                f,
                "descriptor name {name:?} must match [a-z0-9][a-z0-9_-]*"
            ),
            Self::MissingDisciplineBlock { mode } => {
                write!(f, "descriptor with mode {mode} is missing its matching config block")
            }
            Self::ConflictingDisciplineBlocks { mode, found } => write!(
                f,
                "descriptor with mode {mode} must populate exactly one discipline block, found: {}",
                found.join(", ")
            ),
            Self::ScheduleMissingTrigger => {
                write!(f, "schedule_config must set exactly one of cron or interval_seconds")
            }
            Self::ScheduleAmbiguousTrigger => write!(
                f,
                "schedule_config must not set both cron and interval_seconds"
            ),
        }
    }
}

impl std::error::Error for DescriptorError {}

/// Validate that a name matches `[a-z0-9][a-z0-9_-]*`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub(super) fn validate(file: DescriptorFile) -> Result<AgentDescriptor, DescriptorError> {
    if !is_valid_name(&file.name) {
        return Err(DescriptorError::InvalidName(file.name));
    }

    let blocks_present: Vec<&'static str> = [
        file.retry_config.is_some().then_some("retry_config"),
        file.continuous_config.is_some().then_some("continuous_config"),
        file.collaborative_config.is_some().then_some("collaborative_config"),
        file.schedule_config.is_some().then_some("schedule_config"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if blocks_present.len() > 1 {
        return Err(DescriptorError::ConflictingDisciplineBlocks {
            mode: file.mode,
            found: blocks_present,
        });
    }

    let discipline = match file.mode {
        AgentMode::Autonomous => {
            DisciplineConfig::Autonomous(file.retry_config.unwrap_or_default())
        }
        AgentMode::Continuous => {
            let config = file
                .continuous_config
                .ok_or(DescriptorError::MissingDisciplineBlock { mode: file.mode })?;
            DisciplineConfig::Continuous(config)
        }
        AgentMode::Collaborative => {
            DisciplineConfig::Collaborative(file.collaborative_config.unwrap_or_default())
        }
        AgentMode::Scheduled => {
            let config = file
                .schedule_config
                .ok_or(DescriptorError::MissingDisciplineBlock { mode: file.mode })?;
            match (&config.cron, &config.interval_seconds) {
                (Some(_), Some(_)) => return Err(DescriptorError::ScheduleAmbiguousTrigger),
                (None, None) => return Err(DescriptorError::ScheduleMissingTrigger),
                _ => {}
            }
            DisciplineConfig::Scheduled(config)
        }
    };

    Ok(AgentDescriptor {
        name: file.name,
        mode: file.mode,
        system_prompt: file.system_prompt,
        llm: file.llm,
        tools: file.tools,
        subscriptions: file.subscriptions,
        tags: file.tags,
        discipline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LlmConfig;

    fn base_file(mode: AgentMode) -> DescriptorFile {
        DescriptorFile {
            name: "echo-agent".to_owned(),
            mode,
            llm: LlmConfig {
                provider: "openai".to_owned(),
                model: "gpt-4".to_owned(),
                temperature: None,
                max_tokens: None,
                credentials: Default::default(),
            },
            system_prompt: "you are an echo agent".to_owned(),
            subscriptions: vec![],
            tools: vec![],
            tags: vec![],
            retry_config: None,
            continuous_config: None,
            collaborative_config: None,
            schedule_config: None,
        }
    }

    #[test]
    fn valid_name_accepted() {
        assert!(is_valid_name("echo-agent_1"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("9zz"));
    }

    #[test]
    fn invalid_name_rejected() {
        assert!(!is_valid_name("Echo-Agent"));
        assert!(!is_valid_name("_leading-underscore"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
    }

    #[test]
    fn autonomous_without_retry_config_uses_default() {
        let file = base_file(AgentMode::Autonomous);
        let descriptor = AgentDescriptor::try_from_file(file).expect("should validate");
        assert_eq!(descriptor.retry_config().unwrap().max_retries, 2);
    }

    #[test]
    fn continuous_without_config_is_rejected() {
        let file = base_file(AgentMode::Continuous);
        let err = AgentDescriptor::try_from_file(file).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingDisciplineBlock { .. }));
    }

    #[test]
    fn conflicting_blocks_rejected() {
        let mut file = base_file(AgentMode::Autonomous);
        file.retry_config = Some(super::super::RetryConfig::default());
        file.continuous_config = Some(super::super::ContinuousConfig::default());
        let err = AgentDescriptor::try_from_file(file).unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::ConflictingDisciplineBlocks { .. }
        ));
    }

    #[test]
    fn scheduled_requires_exactly_one_trigger() {
        let mut file = base_file(AgentMode::Scheduled);
        file.schedule_config = Some(super::super::ScheduleConfig {
            cron: None,
            interval_seconds: None,
            timezone: None,
            task_data: None,
            timeout_seconds: 300,
        });
        let err = AgentDescriptor::try_from_file(file.clone()).unwrap_err();
        assert!(matches!(err, DescriptorError::ScheduleMissingTrigger));

        file.schedule_config = Some(super::super::ScheduleConfig {
            cron: Some("* * * * *".to_owned()),
            interval_seconds: Some(30),
            timezone: None,
            task_data: None,
            timeout_seconds: 300,
        });
        let err = AgentDescriptor::try_from_file(file).unwrap_err();
        assert!(matches!(err, DescriptorError::ScheduleAmbiguousTrigger));
    }

    #[test]
    fn scheduled_with_interval_only_validates() {
        let mut file = base_file(AgentMode::Scheduled);
        file.schedule_config = Some(super::super::ScheduleConfig {
            cron: None,
            interval_seconds: Some(60),
            timezone: None,
            task_data: None,
            timeout_seconds: 120,
        });
        let descriptor = AgentDescriptor::try_from_file(file).expect("should validate");
        assert_eq!(
            descriptor.schedule_config().unwrap().interval_seconds,
            Some(60)
        );
    }
}
