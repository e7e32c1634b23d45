//! Incident tracking worker.
//!
//! Watches the log for `task_failure` and `task_aborted_output` entries and
//! finalizes the orchestration as failed or aborted accordingly. First
//! incident wins; everything after finalize is moot because the workers are
//! cancelled.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::models::{EntryType, Status};
use crate::services::engine::OrchestrationFinalizer;
use crate::services::log::{Log, LogManager};
use crate::services::task_worker::POLL_INTERVAL;

/// Fails or aborts an orchestration on the first task incident.
pub struct IncidentTracker {
    orchestration_id: String,
    log: Arc<Log>,
    log_manager: Arc<LogManager>,
    finalizer: Arc<dyn OrchestrationFinalizer>,
}

impl IncidentTracker {
    pub fn new(
        orchestration_id: impl Into<String>,
        log: Arc<Log>,
        log_manager: Arc<LogManager>,
        finalizer: Arc<dyn OrchestrationFinalizer>,
    ) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            log,
            log_manager,
            finalizer,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut last_offset: u64 = 0;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = poll.tick() => {}
            }

            for entry in self.log.read_from(last_offset).await {
                last_offset = entry.offset + 1;
                match entry.entry_type {
                    EntryType::TaskFailure => {
                        let error = failure_body(&entry.id, &entry.producer_id, &entry.value);
                        warn!(
                            orchestration_id = %self.orchestration_id,
                            task_id = %entry.producer_id,
                            "task failure, failing orchestration"
                        );
                        let _ = self
                            .log_manager
                            .mark_orchestration_status(
                                &self.orchestration_id,
                                Status::Failed,
                                Some(error.to_string()),
                            )
                            .await;
                        self.finalizer
                            .finalize(
                                &self.orchestration_id,
                                Status::Failed,
                                Some(error),
                                Vec::new(),
                                None,
                            )
                            .await;
                        return;
                    }
                    EntryType::TaskAbortedOutput => {
                        let payload: Value =
                            serde_json::from_slice(&entry.value).unwrap_or(Value::Null);
                        warn!(
                            orchestration_id = %self.orchestration_id,
                            task_id = %entry.producer_id,
                            "task aborted, aborting orchestration"
                        );
                        let _ = self
                            .log_manager
                            .mark_orchestration_status(
                                &self.orchestration_id,
                                Status::Aborted,
                                None,
                            )
                            .await;
                        self.finalizer
                            .finalize(
                                &self.orchestration_id,
                                Status::Aborted,
                                None,
                                Vec::new(),
                                Some(payload),
                            )
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// The JSON error the orchestration fails with: `{id, producer, error}`.
fn failure_body(entry_id: &str, producer_id: &str, value: &[u8]) -> Value {
    let parsed: Value = serde_json::from_slice(value).unwrap_or(Value::Null);
    let error = parsed
        .get("error")
        .cloned()
        .unwrap_or_else(|| Value::String(String::from_utf8_lossy(value).into_owned()));
    json!({
        "id": entry_id,
        "producer": producer_id,
        "error": error,
    })
}
