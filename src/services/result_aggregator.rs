//! Result aggregation worker.
//!
//! Watches the log for `task_output` entries until every executable task
//! has produced one, then finalizes the orchestration as completed with
//! the collected values in task-id order (the last value is the primary
//! result).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::models::plan::TASK_ZERO;
use crate::domain::models::{EntryType, Status};
use crate::services::engine::OrchestrationFinalizer;
use crate::services::log::{Log, LogManager};
use crate::services::task_worker::POLL_INTERVAL;

/// Aggregates task outputs into the orchestration result.
pub struct ResultAggregator {
    orchestration_id: String,
    log: Arc<Log>,
    log_manager: Arc<LogManager>,
    /// Executable task ids, sorted; the aggregator waits for all of them.
    dependencies: Vec<String>,
    finalizer: Arc<dyn OrchestrationFinalizer>,
}

impl ResultAggregator {
    pub fn new(
        orchestration_id: impl Into<String>,
        log: Arc<Log>,
        log_manager: Arc<LogManager>,
        mut dependencies: Vec<String>,
        finalizer: Arc<dyn OrchestrationFinalizer>,
    ) -> Self {
        dependencies.sort();
        dependencies.dedup();
        Self {
            orchestration_id: orchestration_id.into(),
            log,
            log_manager,
            dependencies,
            finalizer,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut collected: HashMap<String, Value> = HashMap::new();
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
                if entry.entry_type != EntryType::TaskOutput
                    || entry.id == TASK_ZERO
                    || !self.dependencies.contains(&entry.id)
                    || collected.contains_key(&entry.id)
                {
                    continue;
                }
                let value = serde_json::from_slice(&entry.value).unwrap_or(Value::Null);
                debug!(
                    orchestration_id = %self.orchestration_id,
                    task_id = %entry.id,
                    "collected task output"
                );
                collected.insert(entry.id, value);
            }

            if collected.len() == self.dependencies.len() {
                break;
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        let results: Vec<Value> = self
            .dependencies
            .iter()
            .filter_map(|id| collected.get(id).cloned())
            .collect();

        let _ = self
            .log_manager
            .mark_orchestration_status(&self.orchestration_id, Status::Completed, None)
            .await;
        info!(
            orchestration_id = %self.orchestration_id,
            results = results.len(),
            "all task outputs collected, completing orchestration"
        );
        self.finalizer
            .finalize(&self.orchestration_id, Status::Completed, None, results, None)
            .await;
    }
}
