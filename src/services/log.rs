//! Append-only orchestration log and its manager.
//!
//! Every task transition, output, and compensation attempt is an immutable
//! entry. Workers communicate only through the log: writers append, readers
//! poll `read_from` with their own offset cursor. Offsets are monotone and
//! dense from zero; duplicate entry ids are silently ignored so racing
//! writers stay safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{EntryType, LogEntry, OrchestrationState, Status};
use crate::domain::ports::storage::Storage;

/// Storage key prefixes for log data.
const ENTRY_PREFIX: &str = "log:entry";
const STATE_PREFIX: &str = "log:state";

/// Default window after which completed orchestrations are not reloaded.
pub const DEFAULT_LOG_RETENTION_HOURS: i64 = 24;

fn entry_key(orchestration_id: &str, offset: u64) -> String {
    // Offsets are zero-padded so lexicographic prefix scans return them in
    // numeric order.
    format!("{ENTRY_PREFIX}:{orchestration_id}:{offset:012}")
}

fn state_key(orchestration_id: &str) -> String {
    format!("{STATE_PREFIX}:{orchestration_id}")
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    seen_ids: HashSet<String>,
}

/// The append-only log of a single orchestration.
///
/// Exclusively owned by the [`LogManager`]; consumers hold read-only
/// handles and never mutate entries.
pub struct Log {
    orchestration_id: String,
    storage: Arc<dyn Storage>,
    inner: RwLock<LogInner>,
}

impl Log {
    fn new(orchestration_id: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            storage,
            inner: RwLock::new(LogInner::default()),
        }
    }

    pub fn orchestration_id(&self) -> &str {
        &self.orchestration_id
    }

    /// Append an entry, assigning the next offset. Returns the assigned
    /// offset, or `None` when an entry with the same id already exists.
    ///
    /// The in-memory append happens first; a storage failure afterwards is
    /// fatal for the process, because continuing would let readers act on
    /// entries that recovery can never see again.
    pub async fn append(&self, mut entry: LogEntry) -> EngineResult<Option<u64>> {
        let (offset, bytes) = {
            let mut inner = self.inner.write().await;
            if inner.seen_ids.contains(&entry.id) {
                debug!(
                    orchestration_id = %self.orchestration_id,
                    entry_id = %entry.id,
                    "duplicate log append ignored"
                );
                return Ok(None);
            }
            let offset = inner.entries.len() as u64;
            entry.offset = offset;
            let bytes = serde_json::to_vec(&entry)
                .map_err(|e| EngineError::Serialization(e.to_string()))?;
            inner.seen_ids.insert(entry.id.clone());
            inner.entries.push(entry);
            (offset, bytes)
        };

        if let Err(err) = self
            .storage
            .put(&entry_key(&self.orchestration_id, offset), bytes)
            .await
        {
            error!(
                orchestration_id = %self.orchestration_id,
                offset,
                error = %err,
                "log persistence failed; aborting to avoid divergence"
            );
            std::process::exit(1);
        }
        Ok(Some(offset))
    }

    /// Entries from `offset` (inclusive) to the current tail, in offset
    /// order. Returns a snapshot; the caller advances its own cursor.
    pub async fn read_from(&self, offset: u64) -> Vec<LogEntry> {
        let inner = self.inner.read().await;
        let start = (offset as usize).min(inner.entries.len());
        inner.entries[start..].to_vec()
    }

    /// Entries of a given type, from the start of the log.
    pub async fn entries_of_type(&self, entry_type: EntryType) -> Vec<LogEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> u64 {
        self.inner.read().await.entries.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Load recovered entries without re-persisting them. Entries must
    /// arrive in offset order.
    async fn hydrate(&self, entries: Vec<LogEntry>) {
        let mut inner = self.inner.write().await;
        for entry in entries {
            if inner.seen_ids.insert(entry.id.clone()) {
                inner.entries.push(entry);
            }
        }
    }
}

/// Owns every orchestration log plus the durable per-orchestration state
/// used for recovery.
pub struct LogManager {
    storage: Arc<dyn Storage>,
    logs: RwLock<HashMap<String, Arc<Log>>>,
    states: RwLock<HashMap<String, OrchestrationState>>,
    retention: Duration,
}

impl LogManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            logs: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            retention: Duration::hours(DEFAULT_LOG_RETENTION_HOURS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Create a fresh log and durable state for an orchestration entering
    /// execution.
    pub async fn create_log(
        &self,
        orchestration_id: &str,
        project_id: &str,
        plan: Option<crate::domain::models::ExecutionPlan>,
    ) -> EngineResult<Arc<Log>> {
        let log = Arc::new(Log::new(orchestration_id, Arc::clone(&self.storage)));
        self.logs
            .write()
            .await
            .insert(orchestration_id.to_string(), Arc::clone(&log));

        let state = OrchestrationState::new(orchestration_id, project_id, plan);
        self.persist_state(&state).await?;
        self.states
            .write()
            .await
            .insert(orchestration_id.to_string(), state);
        Ok(log)
    }

    pub async fn get_log(&self, orchestration_id: &str) -> Option<Arc<Log>> {
        self.logs.read().await.get(orchestration_id).cloned()
    }

    pub async fn get_state(&self, orchestration_id: &str) -> Option<OrchestrationState> {
        self.states.read().await.get(orchestration_id).cloned()
    }

    /// Record a task status transition: storage write first, then memory.
    pub async fn mark_task_status(
        &self,
        orchestration_id: &str,
        task_id: &str,
        status: Status,
    ) -> EngineResult<()> {
        let updated = {
            let states = self.states.read().await;
            let Some(state) = states.get(orchestration_id) else {
                return Err(EngineError::OrchestrationNotFound(
                    orchestration_id.to_string(),
                ));
            };
            let mut updated = state.clone();
            updated.tasks_statuses.insert(task_id.to_string(), status);
            updated.last_updated = Utc::now();
            updated
        };
        self.persist_state(&updated).await?;
        self.states
            .write()
            .await
            .insert(orchestration_id.to_string(), updated);
        Ok(())
    }

    /// Record an orchestration status transition: storage write first,
    /// then memory.
    pub async fn mark_orchestration_status(
        &self,
        orchestration_id: &str,
        status: Status,
        error: Option<String>,
    ) -> EngineResult<()> {
        let updated = {
            let states = self.states.read().await;
            let Some(state) = states.get(orchestration_id) else {
                return Err(EngineError::OrchestrationNotFound(
                    orchestration_id.to_string(),
                ));
            };
            let mut updated = state.clone();
            updated.status = status;
            if error.is_some() {
                updated.error = error;
            }
            updated.last_updated = Utc::now();
            updated
        };
        self.persist_state(&updated).await?;
        self.states
            .write()
            .await
            .insert(orchestration_id.to_string(), updated);
        Ok(())
    }

    async fn persist_state(&self, state: &OrchestrationState) -> EngineResult<()> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| EngineError::Serialization(e.to_string()))?;
        self.storage
            .put(&state_key(&state.id), bytes)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Reload orchestration state and log entries from storage.
    ///
    /// `Pending` states are skipped (they were never executed and are not
    /// re-prepared); `Completed` states older than the retention window are
    /// skipped as expired. Everything else is rehydrated and returned so
    /// the engine can resume in-flight orchestrations.
    pub async fn recover(&self) -> EngineResult<Vec<OrchestrationState>> {
        let raw_states = self
            .storage
            .list_prefix(&format!("{STATE_PREFIX}:"))
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let cutoff = Utc::now() - self.retention;
        let mut recovered = Vec::new();

        for (key, bytes) in raw_states {
            let state: OrchestrationState = match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(%key, error = %err, "skipping unparseable orchestration state");
                    continue;
                }
            };

            if state.status == Status::Pending {
                debug!(orchestration_id = %state.id, "skipping pending orchestration");
                continue;
            }
            if state.status == Status::Completed && state.last_updated < cutoff {
                debug!(orchestration_id = %state.id, "skipping expired completed orchestration");
                continue;
            }

            let log = Arc::new(Log::new(&state.id, Arc::clone(&self.storage)));
            let raw_entries = self
                .storage
                .list_prefix(&format!("{ENTRY_PREFIX}:{}:", state.id))
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            let mut entries = Vec::with_capacity(raw_entries.len());
            for (entry_key, entry_bytes) in raw_entries {
                match serde_json::from_slice::<LogEntry>(&entry_bytes) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        warn!(key = %entry_key, error = %err, "skipping unparseable log entry")
                    }
                }
            }
            entries.sort_by_key(|e| e.offset);
            log.hydrate(entries).await;

            info!(
                orchestration_id = %state.id,
                status = state.status.as_str(),
                entries = log.len().await,
                "recovered orchestration log"
            );

            self.logs
                .write()
                .await
                .insert(state.id.clone(), Arc::clone(&log));
            self.states
                .write()
                .await
                .insert(state.id.clone(), state.clone());
            recovered.push(state);
        }

        Ok(recovered)
    }
}
