//! Configuration Registry: loads agent descriptors from a directory of YAML
//! files, validates them, injects provider credentials, and watches the
//! directory for changes so a running system can pick up edits without a
//! restart.

mod secrets;
mod watch;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::descriptor::{AgentDescriptor, DescriptorError, DescriptorFile};
use conduit_db::models::AgentMode;

pub use secrets::SecretTable;
pub use watch::ReloadNotification;

/// Error loading or validating a single descriptor file.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub file: PathBuf,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file.display(), self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// A point-in-time view of the registry: every descriptor that parsed and
/// validated cleanly, plus the errors for every file that didn't.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    by_name: HashMap<String, Arc<AgentDescriptor>>,
    errors: Vec<ConfigError>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<Arc<AgentDescriptor>> {
        self.by_name.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        self.by_name.values().cloned().collect()
    }

    pub fn list_by_mode(&self, mode: AgentMode) -> Vec<Arc<AgentDescriptor>> {
        self.by_name
            .values()
            .filter(|d| d.mode == mode)
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Loads descriptors from `dir`, parsing every `*.yaml`/`*.yml` file.
///
/// A file that fails to parse as YAML or fails descriptor validation is
/// recorded in [`RegistrySnapshot::errors`] rather than aborting the whole
/// load; one bad descriptor must not take down the fleet.
fn load_dir(dir: &Path, secrets: &SecretTable) -> RegistrySnapshot {
    let mut by_name = HashMap::new();
    let mut errors = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push(ConfigError {
                file: dir.to_path_buf(),
                reason: format!("failed to read directory: {err}"),
            });
            return RegistrySnapshot { by_name, errors };
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }

        match load_one(&path, secrets) {
            Ok(descriptor) => {
                by_name.insert(descriptor.name.clone(), Arc::new(descriptor));
            }
            Err(reason) => errors.push(ConfigError {
                file: path,
                reason,
            }),
        }
    }

    RegistrySnapshot { by_name, errors }
}

fn load_one(path: &Path, secrets: &SecretTable) -> Result<AgentDescriptor, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
    let file: DescriptorFile =
        serde_yaml::from_str(&raw).map_err(|e| format!("yaml parse failed: {e}"))?;
    let mut descriptor =
        AgentDescriptor::try_from_file(file).map_err(|e: DescriptorError| e.to_string())?;
    descriptor.llm.credentials = secrets.for_provider(&descriptor.llm.provider);
    Ok(descriptor)
}

/// The running Configuration Registry.
///
/// Holds a hot-swappable [`RegistrySnapshot`] behind a read-mostly lock and,
/// when started with [`Registry::watch`], a background file watcher that
/// reloads the directory on debounced filesystem events.
pub struct Registry {
    dir: PathBuf,
    secrets: SecretTable,
    snapshot: Arc<RwLock<RegistrySnapshot>>,
    reload_tx: broadcast::Sender<ReloadNotification>,
}

impl Registry {
    /// Load the registry from `dir` once, without starting a watcher.
    pub async fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        anyhow::ensure!(dir.is_dir(), "{} is not a directory", dir.display());

        let secrets = SecretTable::from_env();
        let snapshot = load_dir(&dir, &secrets);
        info!(
            loaded = snapshot.len(),
            errors = snapshot.errors().len(),
            dir = %dir.display(),
            "configuration registry loaded"
        );

        let (reload_tx, _) = broadcast::channel(16);
        Ok(Self {
            dir,
            secrets,
            snapshot: Arc::new(RwLock::new(snapshot)),
            reload_tx,
        })
    }

    /// Start the background watcher. Returns a join handle the caller should
    /// hold for the lifetime of the process; dropping it stops the watch.
    pub fn watch(&self) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        watch::spawn_watcher(
            self.dir.clone(),
            self.secrets.clone(),
            self.snapshot.clone(),
            self.reload_tx.clone(),
        )
        .context("failed to start configuration registry watcher")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadNotification> {
        self.reload_tx.subscribe()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<AgentDescriptor>> {
        self.snapshot.read().await.get(name)
    }

    pub async fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        self.snapshot.read().await.list()
    }

    pub async fn list_by_mode(&self, mode: AgentMode) -> Vec<Arc<AgentDescriptor>> {
        self.snapshot.read().await.list_by_mode(mode)
    }

    pub async fn list_enabled(&self) -> Vec<Arc<AgentDescriptor>> {
        // Every descriptor that loaded cleanly is, by definition, enabled;
        // descriptors with validation errors never make it into the snapshot.
        self.snapshot.read().await.list()
    }

    pub async fn errors(&self) -> Vec<ConfigError> {
        self.snapshot.read().await.errors().to_vec()
    }

    /// Force an immediate reload, bypassing the debounce timer. Used by the
    /// `conduit registry reload` CLI command.
    pub async fn reload_now(&self) -> anyhow::Result<()> {
        let snapshot = load_dir(&self.dir, &self.secrets);
        let loaded = snapshot.len();
        let errors = snapshot.errors().len();
        *self.snapshot.write().await = snapshot;
        if errors > 0 {
            warn!(errors, "registry reload completed with errors");
        }
        let _ = self.reload_tx.send(ReloadNotification { loaded, errors });
        Ok(())
    }

    /// Startup failure policy: abort only if zero descriptors validated, or
    /// if no configured provider has credentials for any descriptor that
    /// requires one. Individual bad files are surfaced via `errors()` but
    /// never block startup by themselves.
    pub async fn check_startup_policy(&self) -> Result<(), StartupPolicyError> {
        let snapshot = self.snapshot.read().await;
        if snapshot.is_empty() {
            return Err(StartupPolicyError::NoValidDescriptors {
                errors: snapshot.errors().len(),
            });
        }

        let missing_credentials: Vec<String> = snapshot
            .list()
            .into_iter()
            .filter(|d| !self.secrets.has_credentials(&d.llm.provider))
            .map(|d| format!("{} (provider {})", d.name, d.llm.provider))
            .collect();

        if missing_credentials.len() == snapshot.len() {
            return Err(StartupPolicyError::NoCredentialedDescriptors {
                descriptors: missing_credentials,
            });
        }

        Ok(())
    }
}

/// Error returned by [`Registry::check_startup_policy`].
#[derive(Debug, Clone)]
pub enum StartupPolicyError {
    NoValidDescriptors { errors: usize },
    NoCredentialedDescriptors { descriptors: Vec<String> },
}

impl fmt::Display for StartupPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValidDescriptors { errors } => write!(
                f,
                "zero descriptors validated ({errors} file error(s)); refusing to start"
            ),
            Self::NoCredentialedDescriptors { descriptors } => write!(
                f,
                "no configured provider has credentials for any loaded descriptor: {}",
                descriptors.join(", ")
            ),
        }
    }
}

impl std::error::Error for StartupPolicyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_descriptor(dir: &Path, name: &str, yaml: &str) {
        let mut f = std::fs::File::create(dir.join(format!("{name}.yaml"))).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
    }

    const VALID_AUTONOMOUS: &str = r#"
name: echo-agent
mode: autonomous
llm:
  provider: openai
  model: gpt-4
system_prompt: "you are an echo agent"
"#;

    const INVALID_NAME: &str = r#"
name: Echo-Agent
mode: autonomous
llm:
  provider: openai
  model: gpt-4
system_prompt: "you are an echo agent"
"#;

    #[tokio::test]
    async fn loads_valid_descriptors_and_records_errors() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), "good", VALID_AUTONOMOUS);
        write_descriptor(tmp.path(), "bad", INVALID_NAME);

        let registry = Registry::load(tmp.path()).await.unwrap();
        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(registry.errors().await.len(), 1);
        assert!(registry.get("echo-agent").await.is_some());
    }

    #[tokio::test]
    async fn startup_policy_rejects_zero_valid_descriptors() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), "bad", INVALID_NAME);

        let registry = Registry::load(tmp.path()).await.unwrap();
        let err = registry.check_startup_policy().await.unwrap_err();
        assert!(matches!(err, StartupPolicyError::NoValidDescriptors { .. }));
    }

    #[tokio::test]
    async fn startup_policy_allows_ollama_with_no_env_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), "good", VALID_AUTONOMOUS.replace("openai", "ollama").as_str());

        let registry = Registry::load(tmp.path()).await.unwrap();
        assert!(registry.check_startup_policy().await.is_ok());
    }

    #[tokio::test]
    async fn list_by_mode_filters() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), "good", VALID_AUTONOMOUS);

        let registry = Registry::load(tmp.path()).await.unwrap();
        assert_eq!(
            registry.list_by_mode(AgentMode::Autonomous).await.len(),
            1
        );
        assert_eq!(
            registry.list_by_mode(AgentMode::Continuous).await.len(),
            0
        );
    }

    #[tokio::test]
    async fn reload_now_picks_up_new_files() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::load(tmp.path()).await.unwrap();
        assert_eq!(registry.list().await.len(), 0);

        write_descriptor(tmp.path(), "good", VALID_AUTONOMOUS);
        registry.reload_now().await.unwrap();
        assert_eq!(registry.list().await.len(), 1);
    }
}
