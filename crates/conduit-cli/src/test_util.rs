//! Test-only helpers shared across `conduit-cli` unit tests.

use std::sync::Mutex;

/// Serializes tests that mutate process-wide environment variables
/// (`CONDUIT_DATABASE_URL`, `CONFIG_DIR`, `CONFIG_HOT_RELOAD`, `HOME`,
/// `XDG_CONFIG_HOME`) so they don't race under the default parallel test
/// runner.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
