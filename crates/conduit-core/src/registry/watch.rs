use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::{load_dir, RegistrySnapshot, SecretTable};

/// Debounce window for the file watcher: a burst of saves (e.g. an editor
/// writing a temp file then renaming it) collapses into a single reload.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Emitted on the registry's broadcast channel after every reload, whether
/// triggered by the watcher or by an explicit `reload_now` call.
#[derive(Debug, Clone, Copy)]
pub struct ReloadNotification {
    pub loaded: usize,
    pub errors: usize,
}

/// Spawn the filesystem watcher and its debounce/reload task.
///
/// `notify`'s callback runs on its own thread and is not `Send`-friendly
/// across an async boundary, so events are forwarded through a std mpsc
/// channel into a blocking bridge thread, which feeds a tokio channel that
/// the async debounce loop below consumes.
pub(super) fn spawn_watcher(
    dir: PathBuf,
    secrets: SecretTable,
    snapshot: Arc<RwLock<RegistrySnapshot>>,
    reload_tx: broadcast::Sender<ReloadNotification>,
) -> notify::Result<tokio::task::JoinHandle<()>> {
    let (std_tx, std_rx) = channel::<notify::Result<notify::Event>>();
    let mut watcher = RecommendedWatcher::new(std_tx, notify::Config::default())?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    let (async_tx, mut async_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    std::thread::spawn(move || {
        for res in std_rx {
            match res {
                Ok(event) => {
                    debug!(?event, "registry watch event");
                    if async_tx.send(()).is_err() {
                        break;
                    }
                }
                Err(err) => error!(%err, "registry watch error"),
            }
        }
    });

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the task's lifetime.
        let _watcher = watcher;
        loop {
            if async_rx.recv().await.is_none() {
                return;
            }
            // Drain any further events that arrive within the debounce
            // window so a burst of writes triggers one reload.
            tokio::time::sleep(DEBOUNCE).await;
            while async_rx.try_recv().is_ok() {}

            let new_snapshot = load_dir(&dir, &secrets);
            let loaded = new_snapshot.len();
            let errors = new_snapshot.errors().len();
            *snapshot.write().await = new_snapshot;
            info!(loaded, errors, "configuration registry reloaded");
            let _ = reload_tx.send(ReloadNotification { loaded, errors });
        }
    });

    Ok(handle)
}
