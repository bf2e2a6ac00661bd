//! State Store (C1): a two-tier key/value cache in front of a durable
//! transactional store, plus the durable execution/plan log.

mod cache;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conduit_db::models::{ContinuousStateRow, ExecutionRecordRow, ExecutionStatus, PlanRunRow, PlanStatus};
use conduit_db::queries::{continuous, executions, plan_run, state_cache};
use flate2::write::DeflateEncoder;
use flate2::read::DeflateDecoder;
use flate2::Compression;
use sqlx::PgPool;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use cache::TierA;

/// Values larger than this (serialized) are deflate-compressed before being
/// written to Tier B, with `compressed=true` recorded alongside.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1_048_576;

/// Default TTL for Tier A entries populated on a Tier B read.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("tier {tier} unavailable")]
    Unavailable { tier: &'static str },
    #[error("stale version for {key}: expected {expected}, found {actual}")]
    StaleVersion { key: String, expected: i64, actual: i64 },
    #[error("no state found for {key}")]
    NotFound { key: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tiered state store: Tier A (in-memory, TTL) in front of Tier B (Postgres).
///
/// There is exactly one implementation of this contract in the core; unlike
/// the Dispatch Bus there is no in-memory test double because the durable
/// log itself (executions, plans) has no meaningful in-memory analogue for
/// the properties tests care about.
pub struct StateStore {
    pool: Arc<PgPool>,
    tier_a: TierA,
    bypass_logged: Mutex<HashMap<String, Instant>>,
}

/// Minimum spacing between "tier A bypass" log lines for the same key prefix.
const BYPASS_LOG_INTERVAL: Duration = Duration::from_secs(60);

impl StateStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            tier_a: TierA::new(),
            bypass_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Write an opaque blob to Tier B (durably) and Tier A (best-effort)
    /// under `key`.
    ///
    /// This is the generic cache path used for ad-hoc keyed state (e.g. the
    /// Orchestrator's routing cache); it does not touch `continuous_state`,
    /// `plan_run`, or `execution_record`, which have their own typed methods
    /// below since they carry additional structure (version, status).
    pub async fn put_state(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StateStoreError> {
        let serialized = serde_json::to_vec(value)?;
        let (payload, compressed) = Self::maybe_compress(&serialized);

        state_cache::put(&self.pool, key, &payload, compressed)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })?;

        self.tier_a.put(key, value.clone(), ttl.unwrap_or(DEFAULT_TTL));
        Ok(())
    }

    /// Tier A first; on miss, read Tier B and re-populate Tier A with the
    /// default TTL. A Tier A lookup never itself fails (it's an in-process
    /// map), so only a Tier B read can return `Unavailable`.
    pub async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StateStoreError> {
        if let Some(value) = self.tier_a.get(key) {
            return Ok(Some(value));
        }

        self.log_bypass_once_per_minute(key);

        let Some(row) = state_cache::get(&self.pool, key)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })?
        else {
            return Ok(None);
        };

        let raw = Self::maybe_decompress(&row.payload, row.compressed)?;
        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        self.tier_a.put(key, value.clone(), DEFAULT_TTL);
        Ok(Some(value))
    }

    /// Emit the "tier A cache miss" warning at most once per minute per key
    /// prefix (the segment before the first `.`), so a hot key under steady
    /// cache pressure doesn't flood the log.
    fn log_bypass_once_per_minute(&self, key: &str) {
        let prefix = key.split('.').next().unwrap_or(key).to_owned();
        let mut logged = self.bypass_logged.lock().expect("bypass log lock poisoned");
        let now = Instant::now();
        let should_log = match logged.get(&prefix) {
            Some(last) => now.duration_since(*last) >= BYPASS_LOG_INTERVAL,
            None => true,
        };
        if should_log {
            logged.insert(prefix.clone(), now);
            drop(logged);
            warn!(key, prefix, "tier A cache miss, falling through to tier B");
        }
    }

    /// Compress `payload` iff it exceeds [`COMPRESSION_THRESHOLD_BYTES`].
    fn maybe_compress(payload: &[u8]) -> (Vec<u8>, bool) {
        if payload.len() <= COMPRESSION_THRESHOLD_BYTES {
            return (payload.to_vec(), false);
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).expect("in-memory write cannot fail");
        (encoder.finish().expect("in-memory finish cannot fail"), true)
    }

    fn maybe_decompress(payload: &[u8], compressed: bool) -> Result<Vec<u8>, StateStoreError> {
        if !compressed {
            return Ok(payload.to_vec());
        }
        let mut decoder = DeflateDecoder::new(payload);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| StateStoreError::Serialization(serde_json::Error::io(e)))?;
        Ok(out)
    }

    /// Durable append of a new QUEUED execution record.
    pub async fn append_execution(
        &self,
        execution_id: Uuid,
        agent_name: &str,
        trace_id: Uuid,
    ) -> Result<ExecutionRecordRow, StateStoreError> {
        executions::append_execution(&self.pool, execution_id, agent_name, trace_id)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn mark_execution_running(&self, execution_id: Uuid) -> Result<(), StateStoreError> {
        executions::mark_running(&self.pool, execution_id)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<&str>,
        retries: i32,
    ) -> Result<(), StateStoreError> {
        executions::complete_execution(&self.pool, execution_id, status, result, error, retries)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionRecordRow, StateStoreError> {
        executions::get_execution(&self.pool, execution_id)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })?
            .ok_or_else(|| StateStoreError::NotFound {
                key: execution_id.to_string(),
            })
    }

    pub async fn list_incomplete_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecordRow>, StateStoreError> {
        executions::list_incomplete_before(&self.pool, before)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn list_recent_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<ExecutionRecordRow>, StateStoreError> {
        executions::list_recent(&self.pool, limit)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn save_plan(
        &self,
        task_id: Uuid,
        plan: serde_json::Value,
        current_step: i32,
        status: PlanStatus,
    ) -> Result<PlanRunRow, StateStoreError> {
        plan_run::save_plan(&self.pool, task_id, plan, current_step, status)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn get_plan(&self, task_id: Uuid) -> Result<Option<PlanRunRow>, StateStoreError> {
        plan_run::get_plan(&self.pool, task_id)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    pub async fn list_active_plans(&self) -> Result<Vec<PlanRunRow>, StateStoreError> {
        plan_run::list_active_plans(&self.pool)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    /// Conditional upsert of continuous agent state.
    ///
    /// `state` is serialized to JSON, compressed if it crosses
    /// [`COMPRESSION_THRESHOLD_BYTES`], then written iff the stored version
    /// equals `expected_version`. On mismatch, returns `StaleVersion`; the
    /// caller is responsible for reloading and retrying, bounded to 3
    /// attempts before failing the originating event.
    pub async fn save_continuous(
        &self,
        agent_name: &str,
        state: &serde_json::Value,
        expected_version: i64,
    ) -> Result<(), StateStoreError> {
        let serialized = serde_json::to_vec(state)?;
        let (payload, compressed) = Self::maybe_compress(&serialized);

        let succeeded = continuous::save_continuous(&self.pool, agent_name, &payload, compressed, expected_version)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })?;

        if !succeeded {
            let actual = self
                .get_continuous_row(agent_name)
                .await?
                .map(|row| row.version)
                .unwrap_or(0);
            return Err(StateStoreError::StaleVersion {
                key: agent_name.to_owned(),
                expected: expected_version,
                actual,
            });
        }
        Ok(())
    }

    async fn get_continuous_row(
        &self,
        agent_name: &str,
    ) -> Result<Option<ContinuousStateRow>, StateStoreError> {
        continuous::get_continuous(&self.pool, agent_name)
            .await
            .map_err(|_| StateStoreError::Unavailable { tier: "B" })
    }

    /// Load and deserialize continuous state, alongside its version for the
    /// caller's next [`Self::save_continuous`] call.
    pub async fn get_continuous(
        &self,
        agent_name: &str,
    ) -> Result<Option<(serde_json::Value, i64)>, StateStoreError> {
        let Some(row) = self.get_continuous_row(agent_name).await? else {
            return Ok(None);
        };
        let raw = Self::maybe_decompress(&row.payload, row.compressed)?;
        let value = serde_json::from_slice(&raw)?;
        Ok(Some((value, row.version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_not_compressed() {
        let payload = b"small";
        let (out, compressed) = StateStore::maybe_compress(payload);
        assert!(!compressed);
        assert_eq!(out, payload);
    }

    #[test]
    fn large_payload_compressed_and_roundtrips() {
        let payload = vec![b'x'; COMPRESSION_THRESHOLD_BYTES + 1];
        let (compressed_bytes, compressed) = StateStore::maybe_compress(&payload);
        assert!(compressed);
        assert!(compressed_bytes.len() < payload.len());

        let restored = StateStore::maybe_decompress(&compressed_bytes, true).unwrap();
        assert_eq!(restored, payload);
    }
}
