//! Compensation worker.
//!
//! When an orchestration fails or aborts, stored compensations of
//! revertible services are replayed in reverse execution order. Each
//! candidate gets bounded attempts inside its TTL; what cannot be delivered
//! becomes a durable `FailedCompensation` record and a webhook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::models::{
    CompensationCandidate, CompensationData, CompensationOutcome, EntryType, FailedCompensation,
    LogEntry, Service, ExecutionPlan, MAX_COMPENSATION_ATTEMPTS,
};
use crate::domain::ports::storage::Storage;
use crate::domain::ports::transport::{
    CompensationContext, OutboundFrame, ServiceTransport, TransportError,
};
use crate::services::backoff::{compensation_backoff, BackoffState};
use crate::services::idempotency::{ExecutionState, IdempotencyStore};
use crate::services::log::Log;
use crate::services::task_worker::POLL_INTERVAL;
use crate::services::webhooks::WebhookNotifier;

/// Producer id stamped on compensation log entries; also part of the
/// compensation idempotency key.
pub const COMPENSATION_PRODUCER: &str = "compensation_worker";

/// How long to wait for one compensation result.
pub const COMPENSATION_WAIT: Duration = Duration::from_secs(30);

/// Scan the log for stored compensations of revertible services, in
/// reverse execution order (descending task id).
pub async fn collect_candidates(
    log: &Log,
    plan: &ExecutionPlan,
    services: &HashMap<String, (Service, Arc<IdempotencyStore>)>,
) -> Vec<CompensationCandidate> {
    let mut candidates = Vec::new();
    for entry in log.entries_of_type(EntryType::CompensationStored).await {
        let task_id = entry.producer_id.clone();
        let Some(task) = plan.get_task(&task_id) else {
            continue;
        };
        let Some((service, _)) = services.get(&task.service) else {
            continue;
        };
        if !service.revertible {
            continue;
        }
        let compensation: CompensationData = match serde_json::from_slice(&entry.value) {
            Ok(data) => data,
            Err(err) => {
                warn!(%task_id, error = %err, "unparseable stored compensation, skipping");
                continue;
            }
        };
        candidates.push(CompensationCandidate {
            task_id,
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            compensation,
            stored_at: entry.timestamp,
        });
    }
    candidates.sort_by(|a, b| b.task_id.cmp(&a.task_id));
    candidates
}

/// Replays stored compensations for one finalized orchestration.
pub struct CompensationWorker {
    orchestration_id: String,
    project_id: String,
    reason: String,
    candidates: Vec<CompensationCandidate>,
    log: Arc<Log>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn ServiceTransport>,
    stores: HashMap<String, Arc<IdempotencyStore>>,
    notifier: WebhookNotifier,
    webhook_urls: Vec<String>,
    wait_timeout: Duration,
}

impl CompensationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestration_id: impl Into<String>,
        project_id: impl Into<String>,
        reason: impl Into<String>,
        candidates: Vec<CompensationCandidate>,
        log: Arc<Log>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn ServiceTransport>,
        stores: HashMap<String, Arc<IdempotencyStore>>,
        notifier: WebhookNotifier,
        webhook_urls: Vec<String>,
    ) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            project_id: project_id.into(),
            reason: reason.into(),
            candidates,
            log,
            storage,
            transport,
            stores,
            notifier,
            webhook_urls,
            wait_timeout: COMPENSATION_WAIT,
        }
    }

    #[cfg(test)]
    fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        for candidate in &self.candidates {
            if cancel.is_cancelled() {
                return;
            }
            let (outcome, attempts, last_error, result) =
                self.compensate_candidate(candidate, &cancel).await;
            self.record_outcome(candidate, outcome, attempts, last_error, result)
                .await;
        }
    }

    /// Drive one candidate to a terminal compensation outcome.
    async fn compensate_candidate(
        &self,
        candidate: &CompensationCandidate,
        cancel: &CancellationToken,
    ) -> (CompensationOutcome, u32, Option<String>, Option<Value>) {
        let Some(store) = self.stores.get(&candidate.service_id) else {
            return (
                CompensationOutcome::Failed,
                0,
                Some(format!("service {} is not registered", candidate.service_id)),
                None,
            );
        };

        let key = compensation_key(&self.orchestration_id, &candidate.task_id);
        let mut backoff = BackoffState::new(compensation_backoff());
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return (CompensationOutcome::Failed, attempts, last_error, None);
            }
            if candidate.is_expired(Utc::now()) {
                return (CompensationOutcome::Expired, attempts, last_error, None);
            }
            if attempts >= MAX_COMPENSATION_ATTEMPTS {
                return (CompensationOutcome::Failed, attempts, last_error, None);
            }

            attempts += 1;
            let execution_id = format!("e_{}", Uuid::new_v4().simple());
            match self
                .dispatch_attempt(candidate, store, &key, &execution_id, attempts)
                .await
            {
                Ok(()) => match self.wait_for_result(store, &key, cancel).await {
                    Ok(Some(result)) => {
                        let partial = result
                            .get("status")
                            .and_then(Value::as_str)
                            .is_some_and(|s| s.eq_ignore_ascii_case("partial"));
                        let outcome = if partial {
                            CompensationOutcome::Partial
                        } else {
                            CompensationOutcome::Completed
                        };
                        return (outcome, attempts, None, Some(result));
                    }
                    Ok(None) => {
                        last_error = Some("no compensation result within wait window".into());
                    }
                    Err(message) => last_error = Some(message),
                },
                Err(message) => last_error = Some(message),
            }

            warn!(
                orchestration_id = %self.orchestration_id,
                task_id = %candidate.task_id,
                attempt = attempts,
                error = last_error.as_deref().unwrap_or("unknown"),
                "compensation attempt failed"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    return (CompensationOutcome::Failed, attempts, last_error, None);
                }
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn dispatch_attempt(
        &self,
        candidate: &CompensationCandidate,
        store: &Arc<IdempotencyStore>,
        key: &str,
        execution_id: &str,
        attempt: u32,
    ) -> Result<(), String> {
        let (record, created) = store.initialize_or_get(key, execution_id).await;
        let should_dispatch = if created {
            true
        } else {
            match record.state {
                ExecutionState::Completed => return Ok(()),
                ExecutionState::Failed => store.reset_failed_execution(key, execution_id).await,
                // Only a session-lost pause is safe to re-send; any other
                // pause or an in-flight execution means the service may
                // still hold the original request.
                ExecutionState::Paused => {
                    store.resume_paused_execution(key, execution_id).await
                }
                ExecutionState::InProgress | ExecutionState::Aborted => false,
            }
        };
        if !should_dispatch {
            return Ok(());
        }

        let frame = OutboundFrame::compensation_request(
            format!("m_{}", Uuid::new_v4().simple()),
            execution_id,
            key,
            &candidate.service_id,
            candidate.compensation.input.clone(),
            CompensationContext {
                orchestration_id: self.orchestration_id.clone(),
                reason: self.reason.clone(),
                payload: candidate.compensation.context.clone(),
                timestamp: Utc::now(),
            },
        );
        self.transport
            .dispatch(&candidate.service_id, frame)
            .await
            .map_err(|err| match err {
                TransportError::NotConnected(_) => {
                    format!("service {} has no live session", candidate.service_name)
                }
                other => other.to_string(),
            })?;

        let entry = LogEntry::new(
            EntryType::CompensationAttempted,
            format!("{}:comp_attempt:{attempt}", candidate.task_id),
            serde_json::to_vec(&candidate.compensation.input).unwrap_or_default(),
            COMPENSATION_PRODUCER,
            attempt,
        );
        let _ = self.log.append(entry).await;
        Ok(())
    }

    /// Wait for a terminal result; `Ok(None)` is a timeout.
    async fn wait_for_result(
        &self,
        store: &Arc<IdempotencyStore>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, String> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err("cancelled".into()),
                _ = poll.tick() => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let Some(record) = store.get_execution_with_result(key).await else {
                continue;
            };
            match record.state {
                ExecutionState::Completed => {
                    let result = record
                        .result
                        .as_deref()
                        .and_then(|bytes| serde_json::from_slice(bytes).ok())
                        .unwrap_or(Value::Null);
                    return Ok(Some(result));
                }
                ExecutionState::Failed => {
                    if let Some(message) = record.failure_for(record.attempt) {
                        return Err(message.to_string());
                    }
                }
                ExecutionState::Aborted => return Err("compensation aborted by service".into()),
                ExecutionState::Paused | ExecutionState::InProgress => {}
            }
        }
    }

    /// Log the terminal entry; failures and expiries also persist a
    /// `FailedCompensation` and fan out to the failure webhooks.
    async fn record_outcome(
        &self,
        candidate: &CompensationCandidate,
        outcome: CompensationOutcome,
        attempts: u32,
        last_error: Option<String>,
        result: Option<Value>,
    ) {
        let entry_type = match outcome {
            CompensationOutcome::Completed => EntryType::CompensationComplete,
            CompensationOutcome::Partial => EntryType::CompensationPartial,
            CompensationOutcome::Failed => EntryType::CompensationFailure,
            CompensationOutcome::Expired => EntryType::CompensationExpired,
        };
        let value = serde_json::json!({
            "task_id": candidate.task_id,
            "status": outcome.as_str(),
            "attempts": attempts,
            "error": last_error,
            "result": result,
        });
        let entry = LogEntry::new(
            entry_type,
            format!("{}:compensation_result", candidate.task_id),
            serde_json::to_vec(&value).unwrap_or_default(),
            COMPENSATION_PRODUCER,
            attempts,
        );
        let _ = self.log.append(entry).await;

        match outcome {
            CompensationOutcome::Completed | CompensationOutcome::Partial => {
                info!(
                    orchestration_id = %self.orchestration_id,
                    task_id = %candidate.task_id,
                    status = outcome.as_str(),
                    attempts,
                    "compensation delivered"
                );
            }
            CompensationOutcome::Failed | CompensationOutcome::Expired => {
                let record = FailedCompensation::new(
                    &self.project_id,
                    &self.orchestration_id,
                    candidate,
                    outcome,
                    last_error,
                    attempts,
                );
                warn!(
                    orchestration_id = %self.orchestration_id,
                    task_id = %candidate.task_id,
                    status = outcome.as_str(),
                    attempts,
                    "compensation could not be delivered"
                );
                self.persist_failed_compensation(&record).await;
                self.notifier
                    .notify_compensation_failure(&self.webhook_urls, &record)
                    .await;
            }
        }
    }

    async fn persist_failed_compensation(&self, record: &FailedCompensation) {
        let Ok(bytes) = serde_json::to_vec(record) else {
            return;
        };
        let info_key = format!("failedcomp:info:{}", record.id);
        let project_key = format!("failedcomp:project:{}:{}", record.project_id, record.id);
        let orchestration_key = format!(
            "failedcomp:orchestration:{}:{}",
            record.orchestration_id, record.id
        );
        for (key, value) in [
            (info_key, bytes),
            (project_key, record.id.clone().into_bytes()),
            (orchestration_key, record.id.clone().into_bytes()),
        ] {
            if let Err(err) = self.storage.put(&key, value).await {
                warn!(%key, error = %err, "failed to persist failed-compensation record");
            }
        }
    }
}

/// Deterministic compensation key; shared across retries and restarts.
pub fn compensation_key(orchestration_id: &str, task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(orchestration_id.as_bytes());
    hasher.update(task_id.as_bytes());
    hasher.update(COMPENSATION_PRODUCER.as_bytes());
    hex::encode(hasher.finalize())
}
