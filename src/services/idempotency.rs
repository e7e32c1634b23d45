//! Per-service idempotency store.
//!
//! Each registered service owns one store. Task workers key executions by a
//! deterministic hash so retried dispatches deduplicate on the service side,
//! and the transport routes service results back into the store. While a
//! lease is live, only the holding execution may advance the record; stale
//! results are dropped.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Default lease a worker holds on an execution.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// State of one keyed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    InProgress,
    Paused,
    Completed,
    Failed,
    Aborted,
}

/// Why an execution was parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// The service had no live session, so the request never reached it;
    /// it must be re-sent once a session is back.
    SessionLost,
    /// The request is (or may be) with the service; keep observing the
    /// original execution instead of re-sending.
    AwaitingResult,
}

/// An interim result delivered while the execution is still in progress.
#[derive(Debug, Clone)]
pub struct InterimResult {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// The tracked record of one keyed execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// The worker-side execution currently holding the lease.
    pub execution_id: String,
    pub state: ExecutionState,
    /// Set while `state` is `Paused`.
    pub pause_reason: Option<PauseReason>,
    pub result: Option<Vec<u8>>,
    /// Attempt counter; bumped when a failed execution is reset.
    pub attempt: u32,
    /// Failure messages keyed by the attempt they occurred in.
    failures: HashMap<u32, String>,
    interim: Vec<InterimResult>,
    pub lease_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    fn new(execution_id: String, lease: Duration) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            state: ExecutionState::InProgress,
            pause_reason: None,
            result: None,
            attempt: 0,
            failures: HashMap::new(),
            interim: Vec::new(),
            lease_expires_at: now + lease_delta(lease),
            created_at: now,
            updated_at: now,
        }
    }

    /// Failure recorded for a given attempt, if any.
    pub fn failure_for(&self, attempt: u32) -> Option<&str> {
        self.failures.get(&attempt).map(String::as_str)
    }

    fn lease_live(&self, now: DateTime<Utc>) -> bool {
        now < self.lease_expires_at
    }

    /// Whether a caller identified by `execution_id` may advance this
    /// record: it holds the lease, or no live holder exists.
    fn holder_may_advance(&self, execution_id: &str, now: DateTime<Utc>) -> bool {
        self.execution_id == execution_id || !self.lease_live(now)
    }

    fn is_settled(&self) -> bool {
        matches!(self.state, ExecutionState::Completed | ExecutionState::Aborted)
    }
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Execution store scoped to a single service.
pub struct IdempotencyStore {
    lease_duration: Duration,
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION)
    }
}

impl IdempotencyStore {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            lease_duration,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Create the record as `InProgress` under `execution_id`, or return
    /// the existing one. The boolean reports whether this call created it.
    pub async fn initialize_or_get(
        &self,
        key: &str,
        execution_id: &str,
    ) -> (ExecutionRecord, bool) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get(key) {
            return (record.clone(), false);
        }
        let record = ExecutionRecord::new(execution_id.to_string(), self.lease_duration);
        records.insert(key.to_string(), record.clone());
        (record, true)
    }

    /// Extend the lease if `execution_id` still holds it.
    pub async fn renew_lease(&self, key: &str, execution_id: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        if record.execution_id != execution_id {
            return false;
        }
        record.lease_expires_at = Utc::now() + lease_delta(self.lease_duration);
        record.updated_at = Utc::now();
        true
    }

    /// Park an in-progress execution, remembering why. No-op in any other
    /// state.
    pub async fn pause_execution(&self, key: &str, reason: PauseReason) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(key) {
            if record.state == ExecutionState::InProgress {
                record.state = ExecutionState::Paused;
                record.pause_reason = Some(reason);
                record.updated_at = Utc::now();
            }
        }
    }

    /// Record a terminal result from `execution_id`: bytes complete the
    /// execution, an error fails it and is remembered for the current
    /// attempt. Returns `false` when the result was dropped: the record is
    /// already settled, or another holder's lease is still live.
    pub async fn update_execution_result(
        &self,
        key: &str,
        execution_id: &str,
        result: Option<Vec<u8>>,
        error: Option<String>,
    ) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        let now = Utc::now();
        if record.is_settled() || !record.holder_may_advance(execution_id, now) {
            return false;
        }
        match (result, error) {
            (Some(bytes), _) => {
                record.state = ExecutionState::Completed;
                record.result = Some(bytes);
            }
            (None, Some(message)) => {
                record.state = ExecutionState::Failed;
                let attempt = record.attempt;
                record.failures.insert(attempt, message);
            }
            (None, None) => {}
        }
        record.pause_reason = None;
        record.updated_at = now;
        true
    }

    /// Return a failed execution to `InProgress` under a new holder,
    /// keeping the failure history. A failure ends the holding execution,
    /// so any caller may reset; only the state is checked.
    pub async fn reset_failed_execution(&self, key: &str, execution_id: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        if record.state != ExecutionState::Failed {
            return false;
        }
        let now = Utc::now();
        record.state = ExecutionState::InProgress;
        record.pause_reason = None;
        record.result = None;
        record.attempt += 1;
        record.execution_id = execution_id.to_string();
        record.lease_expires_at = now + lease_delta(self.lease_duration);
        record.updated_at = now;
        true
    }

    /// Return a session-lost pause to `InProgress` under a new holder so
    /// the request can be re-sent. Refused for any other pause: the
    /// service may still hold the original request, and re-sending would
    /// duplicate it. Does not bump the attempt counter.
    pub async fn resume_paused_execution(&self, key: &str, execution_id: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        if record.state != ExecutionState::Paused
            || record.pause_reason != Some(PauseReason::SessionLost)
        {
            return false;
        }
        let now = Utc::now();
        record.state = ExecutionState::InProgress;
        record.pause_reason = None;
        record.execution_id = execution_id.to_string();
        record.lease_expires_at = now + lease_delta(self.lease_duration);
        record.updated_at = now;
        true
    }

    /// Queue an interim result from `execution_id` while the execution
    /// runs. Dropped for settled records and stale holders.
    pub async fn track_interim_result(
        &self,
        key: &str,
        execution_id: &str,
        data: Vec<u8>,
    ) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        let now = Utc::now();
        if record.is_settled() || !record.holder_may_advance(execution_id, now) {
            return false;
        }
        record.interim.push(InterimResult {
            data,
            timestamp: now,
        });
        record.updated_at = now;
        true
    }

    /// Drain queued interim results, oldest first.
    pub async fn pop_any_interim_results(&self, key: &str) -> Vec<InterimResult> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return Vec::new();
        };
        let mut drained = std::mem::take(&mut record.interim);
        drained.sort_by_key(|r| r.timestamp);
        drained
    }

    /// Record an abort result from `execution_id`; the execution
    /// terminates as `Aborted`. Dropped for settled records and stale
    /// holders.
    pub async fn track_abort_result(&self, key: &str, execution_id: &str, data: Vec<u8>) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        let now = Utc::now();
        if record.is_settled() || !record.holder_may_advance(execution_id, now) {
            return false;
        }
        record.state = ExecutionState::Aborted;
        record.pause_reason = None;
        record.result = Some(data);
        record.updated_at = now;
        true
    }

    pub async fn get_execution_with_result(&self, key: &str) -> Option<ExecutionRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Drop a record; used when an orchestration is expunged.
    pub async fn remove(&self, key: &str) {
        self.records.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_or_get_creates_once() {
        let store = IdempotencyStore::default();
        let (record, created) = store.initialize_or_get("k1", "e1").await;
        assert!(created);
        assert_eq!(record.state, ExecutionState::InProgress);

        let (record, created) = store.initialize_or_get("k1", "e2").await;
        assert!(!created);
        assert_eq!(record.execution_id, "e1");
    }

    #[tokio::test]
    async fn test_complete_then_get() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        assert!(
            store
                .update_execution_result("k1", "e1", Some(b"{\"ok\":true}".to_vec()), None)
                .await
        );
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert!(record.result.is_some());
    }

    #[tokio::test]
    async fn test_failure_recorded_per_attempt() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store
            .update_execution_result("k1", "e1", None, Some("boom".into()))
            .await;
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(record.failure_for(0), Some("boom"));
        assert_eq!(record.failure_for(1), None);

        assert!(store.reset_failed_execution("k1", "e1").await);
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::InProgress);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.failure_for(0), Some("boom"));

        store
            .update_execution_result("k1", "e1", None, Some("boom again".into()))
            .await;
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.failure_for(1), Some("boom again"));
    }

    #[tokio::test]
    async fn test_failed_execution_resettable_by_fresh_id() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store
            .update_execution_result("k1", "e1", None, Some("boom".into()))
            .await;
        // A failure ends the holding execution; the retry's fresh id takes
        // over, and the failed attempt's stale id can no longer advance.
        assert!(store.reset_failed_execution("k1", "e2").await);
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.execution_id, "e2");
        assert_eq!(record.state, ExecutionState::InProgress);
        assert!(
            !store
                .update_execution_result("k1", "e1", Some(b"stale".to_vec()), None)
                .await
        );
        // Resetting again is refused: the record is no longer failed.
        assert!(!store.reset_failed_execution("k1", "e3").await);
    }

    #[tokio::test]
    async fn test_renew_lease_requires_holder() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        assert!(store.renew_lease("k1", "e1").await);
        assert!(!store.renew_lease("k1", "e2").await);
        assert!(!store.renew_lease("missing", "e1").await);
    }

    #[tokio::test]
    async fn test_stale_holder_result_rejected_while_lease_live() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        assert!(
            !store
                .update_execution_result("k1", "e2", Some(b"late".to_vec()), None)
                .await
        );
        assert!(!store.track_abort_result("k1", "e2", b"late".to_vec()).await);
        assert!(!store.track_interim_result("k1", "e2", b"late".to_vec()).await);
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::InProgress);
    }

    #[tokio::test]
    async fn test_any_caller_may_advance_after_lease_expiry() {
        // Zero-length lease: the holder lapses immediately.
        let store = IdempotencyStore::new(Duration::ZERO);
        store.initialize_or_get("k1", "e1").await;
        assert!(
            store
                .update_execution_result("k1", "e2", Some(b"done".to_vec()), None)
                .await
        );
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_settled_record_ignores_late_updates() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store
            .update_execution_result("k1", "e1", Some(b"done".to_vec()), None)
            .await;
        assert!(
            !store
                .update_execution_result("k1", "e1", None, Some("late failure".into()))
                .await
        );
        assert!(!store.track_abort_result("k1", "e1", b"late".to_vec()).await);
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.result, Some(b"done".to_vec()));
    }

    #[tokio::test]
    async fn test_pause_only_from_in_progress() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store.pause_execution("k1", PauseReason::AwaitingResult).await;
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Paused);
        assert_eq!(record.pause_reason, Some(PauseReason::AwaitingResult));

        store
            .update_execution_result("k1", "e1", Some(b"done".to_vec()), None)
            .await;
        store.pause_execution("k1", PauseReason::AwaitingResult).await;
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.pause_reason, None);
    }

    #[tokio::test]
    async fn test_resume_only_for_session_lost_pause() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store.pause_execution("k1", PauseReason::SessionLost).await;
        assert!(store.resume_paused_execution("k1", "e2").await);
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::InProgress);
        assert_eq!(record.execution_id, "e2");
        assert_eq!(record.attempt, 0);
        // Not paused anymore: a second resume is a no-op.
        assert!(!store.resume_paused_execution("k1", "e3").await);

        // A timeout pause keeps the original execution observable and is
        // never resumed for re-dispatch.
        store.initialize_or_get("k2", "e1").await;
        store.pause_execution("k2", PauseReason::AwaitingResult).await;
        assert!(!store.resume_paused_execution("k2", "e2").await);
        let record = store.get_execution_with_result("k2").await.unwrap();
        assert_eq!(record.state, ExecutionState::Paused);
        assert_eq!(record.execution_id, "e1");
    }

    #[tokio::test]
    async fn test_late_result_completes_timeout_paused_execution() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store.pause_execution("k1", PauseReason::AwaitingResult).await;
        // The original holder's result still lands.
        assert!(
            store
                .update_execution_result("k1", "e1", Some(b"late but mine".to_vec()), None)
                .await
        );
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_interim_results_drain_in_order() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        store.track_interim_result("k1", "e1", b"one".to_vec()).await;
        store.track_interim_result("k1", "e1", b"two".to_vec()).await;
        let drained = store.pop_any_interim_results("k1").await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data, b"one");
        assert!(store.pop_any_interim_results("k1").await.is_empty());
    }

    #[tokio::test]
    async fn test_abort_result() {
        let store = IdempotencyStore::default();
        store.initialize_or_get("k1", "e1").await;
        assert!(
            store
                .track_abort_result("k1", "e1", b"{\"reason\":\"user\"}".to_vec())
                .await
        );
        let record = store.get_execution_with_result("k1").await.unwrap();
        assert_eq!(record.state, ExecutionState::Aborted);
        assert!(record.result.is_some());
    }
}
