//! Per-task execution worker.
//!
//! One worker drives one plan task from pending to a terminal outcome. It
//! polls the orchestration log for its dependencies, dispatches the task
//! over the service transport under an idempotency key, renews the
//! execution lease, drains interim results, and applies the retry and
//! health-pause policies. All coordination happens through the log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    CompensationData, EntryType, LogEntry, Service, Status, SubTask, TaskStatusPayload,
};
use crate::domain::ports::transport::{OutboundFrame, ServiceTransport, TransportError};
use crate::services::backoff::{task_retry_backoff, BackoffState};
use crate::services::idempotency::{ExecutionState, IdempotencyStore, PauseReason};
use crate::services::log::{Log, LogManager};
use crate::services::vector_cache::canonical_json;

/// Consecutive real failures before the task fails permanently.
pub const MAX_TASK_RETRIES: u32 = 5;

/// Log polling cadence shared by all workers.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared dependencies for the workers of one orchestration.
pub struct TaskWorkerContext {
    pub orchestration_id: String,
    pub log: Arc<Log>,
    pub log_manager: Arc<LogManager>,
    pub transport: Arc<dyn ServiceTransport>,
    /// Per-attempt execution budget.
    pub task_timeout: Duration,
    /// How long an unhealthy service may pause the task.
    pub health_grace_period: Duration,
}

enum ExecOutcome {
    Completed(Vec<u8>),
    Aborted(Vec<u8>),
}

/// Tracks how long the task has been parked and why.
#[derive(Default)]
struct PauseTracker {
    start: Option<Instant>,
    by_health: bool,
}

/// Worker driving a single task.
pub struct TaskWorker {
    ctx: Arc<TaskWorkerContext>,
    task: SubTask,
    service: Service,
    store: Arc<IdempotencyStore>,
    interim_seq: u64,
    status_seq: u64,
}

impl TaskWorker {
    pub fn new(
        ctx: Arc<TaskWorkerContext>,
        task: SubTask,
        service: Service,
        store: Arc<IdempotencyStore>,
    ) -> Self {
        Self {
            ctx,
            task,
            service,
            store,
            interim_seq: 0,
            status_seq: 0,
        }
    }

    /// Run until the task reaches a terminal outcome or the token fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let deps: HashSet<String> = self.task.dependency_ids();
        let mut dependency_state: HashMap<String, Vec<u8>> = HashMap::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut last_offset: u64 = 0;

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = poll.tick() => {}
            }

            for entry in self.ctx.log.read_from(last_offset).await {
                last_offset = entry.offset + 1;
                if entry.entry_type == EntryType::TaskOutput
                    && deps.contains(&entry.id)
                    && !processed.contains(&entry.id)
                {
                    processed.insert(entry.id.clone());
                    dependency_state.insert(entry.id.clone(), entry.value);
                }
            }

            if dependency_state.len() == deps.len() {
                break;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        debug!(
            orchestration_id = %self.ctx.orchestration_id,
            task_id = %self.task.id,
            "dependencies satisfied"
        );
        self.record_status(Status::Processing, None, 0, &cancel).await;
        self.execute_with_retries(&dependency_state, &cancel).await;
    }

    /// The retry/pause loop around individual execution attempts.
    async fn execute_with_retries(
        &mut self,
        dependency_state: &HashMap<String, Vec<u8>>,
        cancel: &CancellationToken,
    ) {
        let mut consecutive_errs: u32 = 0;
        let mut backoff = BackoffState::new(task_retry_backoff());
        let mut pause = PauseTracker::default();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !self.ctx.transport.is_service_healthy(&self.service.id).await {
                if self
                    .enter_pause(&mut pause, true, "service unhealthy", cancel)
                    .await
                {
                    return;
                }
                if self.sleep_or_cancel(backoff.next_delay(), cancel).await {
                    return;
                }
                continue;
            }
            if pause.by_health && pause.start.take().is_some() {
                info!(
                    orchestration_id = %self.ctx.orchestration_id,
                    task_id = %self.task.id,
                    "service healthy again, resuming"
                );
                pause.by_health = false;
                backoff.reset();
                self.record_status(Status::Processing, None, consecutive_errs, cancel)
                    .await;
            }

            match self.execute_once(dependency_state, cancel).await {
                Ok(ExecOutcome::Completed(result)) => {
                    self.handle_completed(&result, cancel).await;
                    return;
                }
                Ok(ExecOutcome::Aborted(payload)) => {
                    self.handle_aborted(&payload, cancel).await;
                    return;
                }
                Err(err) if err.is_pause() => {
                    if self
                        .enter_pause(&mut pause, false, &err.to_string(), cancel)
                        .await
                    {
                        return;
                    }
                    if self.sleep_or_cancel(backoff.next_delay(), cancel).await {
                        return;
                    }
                }
                Err(err) if err.is_retryable_execution() => {
                    consecutive_errs += 1;
                    warn!(
                        orchestration_id = %self.ctx.orchestration_id,
                        task_id = %self.task.id,
                        attempt = consecutive_errs,
                        error = %err,
                        "task attempt failed"
                    );
                    self.record_status(
                        Status::Failed,
                        Some(err.to_string()),
                        consecutive_errs,
                        cancel,
                    )
                    .await;
                    if consecutive_errs >= MAX_TASK_RETRIES {
                        self.fail_permanently(&err.to_string(), consecutive_errs, cancel)
                            .await;
                        return;
                    }
                    if self.sleep_or_cancel(backoff.next_delay(), cancel).await {
                        return;
                    }
                }
                Err(err) => {
                    self.fail_permanently(&err.to_string(), consecutive_errs, cancel)
                        .await;
                    return;
                }
            }
        }
    }

    /// Record a pause, and permanently fail once the grace period is
    /// exceeded. Returns `true` when the worker should stop.
    async fn enter_pause(
        &mut self,
        pause: &mut PauseTracker,
        by_health: bool,
        reason: &str,
        cancel: &CancellationToken,
    ) -> bool {
        if pause.start.is_none() {
            pause.start = Some(Instant::now());
            pause.by_health = by_health;
            self.record_status(Status::Paused, Some(reason.to_string()), 0, cancel)
                .await;
        }
        let paused_for = pause.start.map(|s| s.elapsed()).unwrap_or_default();
        if paused_for >= self.ctx.health_grace_period {
            self.fail_permanently(
                &format!("health check grace period exceeded while paused: {reason}"),
                0,
                cancel,
            )
            .await;
            return true;
        }
        false
    }

    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    /// One execution attempt against the idempotency store + transport.
    async fn execute_once(
        &mut self,
        dependency_state: &HashMap<String, Vec<u8>>,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecOutcome> {
        let input = self.merge_dependency_inputs(dependency_state)?;
        let key = idempotency_key(&self.ctx.orchestration_id, &self.task.id, &input);
        let execution_id = format!("e_{}", Uuid::new_v4().simple());

        let (record, created) = self.store.initialize_or_get(&key, &execution_id).await;
        match record.state {
            ExecutionState::Completed => {
                return Ok(ExecOutcome::Completed(record.result.unwrap_or_default()));
            }
            ExecutionState::Failed => {
                if self.store.reset_failed_execution(&key, &execution_id).await {
                    self.dispatch(&key, &execution_id, &input).await?;
                }
            }
            ExecutionState::Paused => {
                // Only a session-lost pause is re-dispatched: the request
                // never reached the service. A timeout pause means the
                // service may still hold the original request, so the
                // worker keeps observing it; the resume is refused and no
                // second request goes out.
                if self
                    .store
                    .resume_paused_execution(&key, &execution_id)
                    .await
                {
                    self.dispatch(&key, &execution_id, &input).await?;
                }
            }
            _ if created => {
                self.dispatch(&key, &execution_id, &input).await?;
            }
            // InProgress or Aborted under another holder: observe.
            _ => {}
        }

        let renew_cancel = cancel.child_token();
        let renewal = self.spawn_lease_renewal(&key, &execution_id, renew_cancel.clone());

        let outcome = self.wait_for_result(&key, cancel).await;
        renew_cancel.cancel();
        let _ = renewal.await;
        outcome
    }

    async fn dispatch(&self, key: &str, execution_id: &str, input: &Value) -> EngineResult<()> {
        let frame = OutboundFrame::task_request(
            format!("m_{}", Uuid::new_v4().simple()),
            execution_id,
            key,
            &self.service.id,
            input.clone(),
        );
        match self.ctx.transport.dispatch(&self.service.id, frame).await {
            Ok(()) => Ok(()),
            Err(TransportError::NotConnected(_)) => {
                self.store
                    .pause_execution(key, PauseReason::SessionLost)
                    .await;
                Err(EngineError::PauseRequested(format!(
                    "service {} has no live session",
                    self.service.name
                )))
            }
            Err(err) => Err(EngineError::RetryableExecution(err.to_string())),
        }
    }

    fn spawn_lease_renewal(
        &self,
        key: &str,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let transport = Arc::clone(&self.ctx.transport);
        let service_id = self.service.id.clone();
        let key = key.to_string();
        let execution_id = execution_id.to_string();
        let period = store.lease_duration() / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !transport.is_service_healthy(&service_id).await {
                    store.pause_execution(&key, PauseReason::SessionLost).await;
                    return;
                }
                if !store.renew_lease(&key, &execution_id).await {
                    return;
                }
            }
        })
    }

    /// Poll the store until the execution terminates or the task budget
    /// runs out. Interim results are drained to the log as they arrive.
    async fn wait_for_result(
        &mut self,
        key: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecOutcome> {
        let deadline = Instant::now() + self.ctx.task_timeout;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(EngineError::PauseRequested("worker cancelled".into()));
                }
                _ = poll.tick() => {}
            }

            if Instant::now() >= deadline {
                // The service may still be working on the request; park the
                // execution for observation rather than re-sending it.
                self.store
                    .pause_execution(key, PauseReason::AwaitingResult)
                    .await;
                return Err(EngineError::PauseRequested(format!(
                    "no result within {:?}",
                    self.ctx.task_timeout
                )));
            }

            let Some(record) = self.store.get_execution_with_result(key).await else {
                continue;
            };
            match record.state {
                ExecutionState::Completed => {
                    return Ok(ExecOutcome::Completed(record.result.unwrap_or_default()));
                }
                ExecutionState::Failed => {
                    if let Some(message) = record.failure_for(record.attempt) {
                        return Err(EngineError::RetryableExecution(message.to_string()));
                    }
                }
                ExecutionState::Aborted => {
                    return Ok(ExecOutcome::Aborted(record.result.unwrap_or_default()));
                }
                ExecutionState::Paused => {
                    return Err(EngineError::PauseRequested("PAUSE_EXECUTION".into()));
                }
                ExecutionState::InProgress => {
                    for interim in self.store.pop_any_interim_results(key).await {
                        self.interim_seq += 1;
                        let entry = LogEntry::new(
                            EntryType::TaskInterimOutput,
                            format!("{}:interim:{}", self.task.id, self.interim_seq),
                            interim.data,
                            &self.task.id,
                            0,
                        );
                        let _ = self.ctx.log.append(entry).await;
                    }
                }
            }
        }
    }

    /// Resolve `$<taskId>.<field>` inputs against collected dependency
    /// outputs; literals pass through.
    fn merge_dependency_inputs(
        &self,
        dependency_state: &HashMap<String, Vec<u8>>,
    ) -> EngineResult<Value> {
        let mut parsed: HashMap<&str, Value> = HashMap::new();
        for (dep_id, bytes) in dependency_state {
            let value = serde_json::from_slice(bytes).map_err(|e| {
                EngineError::RetryableExecution(format!(
                    "dependency {dep_id} output is not valid JSON: {e}"
                ))
            })?;
            parsed.insert(dep_id.as_str(), value);
        }

        let mappings = self.task.dependency_mappings();
        let mut merged = serde_json::Map::new();
        for (input_key, value) in &self.task.input {
            if let Some((_, dep_id, field)) = mappings
                .iter()
                .find(|(key, _, _)| key == input_key)
                .map(|(k, d, f)| (k.clone(), d.clone(), f.clone()))
            {
                let dep_value = parsed.get(dep_id.as_str()).ok_or_else(|| {
                    EngineError::RetryableExecution(format!(
                        "dependency {dep_id} output missing for task {}",
                        self.task.id
                    ))
                })?;
                let resolved = dep_value.get(&field).cloned().ok_or_else(|| {
                    EngineError::RetryableExecution(format!(
                        "dependency {dep_id} output has no field '{field}'"
                    ))
                })?;
                merged.insert(input_key.clone(), resolved);
            } else {
                merged.insert(input_key.clone(), value.clone());
            }
        }
        Ok(Value::Object(merged))
    }

    async fn handle_completed(&mut self, result: &[u8], cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let payload: Value = serde_json::from_slice(result).unwrap_or(Value::Null);
        let (output, compensation) = split_result_payload(&payload);

        let output_bytes = serde_json::to_vec(&output).unwrap_or_default();
        let entry = LogEntry::new(
            EntryType::TaskOutput,
            &self.task.id,
            output_bytes,
            &self.task.id,
            0,
        );
        let _ = self.ctx.log.append(entry).await;

        if self.service.revertible {
            if let Some(compensation) = compensation {
                let data = normalize_compensation(compensation);
                let bytes = serde_json::to_vec(&data).unwrap_or_default();
                let entry = LogEntry::new(
                    EntryType::CompensationStored,
                    format!("{}:compensation", self.task.id),
                    bytes,
                    &self.task.id,
                    0,
                );
                let _ = self.ctx.log.append(entry).await;
            }
        }

        self.record_status(Status::Completed, None, 0, cancel).await;
        info!(
            orchestration_id = %self.ctx.orchestration_id,
            task_id = %self.task.id,
            "task completed"
        );
    }

    async fn handle_aborted(&mut self, payload: &[u8], cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let entry = LogEntry::new(
            EntryType::TaskAbortedOutput,
            &self.task.id,
            payload.to_vec(),
            &self.task.id,
            0,
        );
        let _ = self.ctx.log.append(entry).await;
        self.record_status(Status::Aborted, None, 0, cancel).await;
        warn!(
            orchestration_id = %self.ctx.orchestration_id,
            task_id = %self.task.id,
            "task aborted"
        );
    }

    async fn fail_permanently(&mut self, error: &str, attempts: u32, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let body = serde_json::json!({
            "id": self.task.id,
            "producer": self.task.id,
            "error": error,
        });
        let entry = LogEntry::new(
            EntryType::TaskFailure,
            format!("{}:failure", self.task.id),
            serde_json::to_vec(&body).unwrap_or_default(),
            &self.task.id,
            attempts,
        );
        let _ = self.ctx.log.append(entry).await;
        let _ = self
            .ctx
            .log_manager
            .mark_task_status(&self.ctx.orchestration_id, &self.task.id, Status::Failed)
            .await;
        warn!(
            orchestration_id = %self.ctx.orchestration_id,
            task_id = %self.task.id,
            attempts,
            error,
            "task failed permanently"
        );
    }

    /// Append a `task_status` entry and update the durable state.
    async fn record_status(
        &mut self,
        status: Status,
        error: Option<String>,
        attempt: u32,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        self.status_seq += 1;
        let payload = TaskStatusPayload {
            task_id: self.task.id.clone(),
            status,
            error,
        };
        let entry = LogEntry::new(
            EntryType::TaskStatus,
            format!("{}:status:{}", self.task.id, self.status_seq),
            serde_json::to_vec(&payload).unwrap_or_default(),
            &self.task.id,
            attempt,
        );
        let _ = self.ctx.log.append(entry).await;
        let _ = self
            .ctx
            .log_manager
            .mark_task_status(&self.ctx.orchestration_id, &self.task.id, status)
            .await;
    }
}

/// Deterministic execution key: stable across retries for the same inputs.
pub fn idempotency_key(orchestration_id: &str, task_id: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(orchestration_id.as_bytes());
    hasher.update(task_id.as_bytes());
    hasher.update(canonical_json(input).as_bytes());
    hex::encode(hasher.finalize())
}

/// A service result payload may wrap its output as `{task, compensation}`.
fn split_result_payload(payload: &Value) -> (Value, Option<&Value>) {
    match payload.as_object() {
        Some(object) if object.contains_key("task") => (
            object.get("task").cloned().unwrap_or(Value::Null),
            object.get("compensation"),
        ),
        _ => (payload.clone(), None),
    }
}

/// Accept either a full compensation object or a bare payload.
fn normalize_compensation(value: &Value) -> CompensationData {
    if value.as_object().is_some_and(|o| o.contains_key("input")) {
        if let Ok(data) = serde_json::from_value::<CompensationData>(value.clone()) {
            return data;
        }
    }
    CompensationData {
        input: value.clone(),
        context: None,
        ttl_ms: crate::domain::models::DEFAULT_COMPENSATION_TTL_MS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ExecutionPlan, Schema, ServiceKind, ServiceSchema};
    use crate::domain::ports::storage::InMemoryStorage;
    use crate::domain::ports::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Transport double that answers dispatches by writing into the
    /// idempotency store, like a loopback service.
    struct LoopbackTransport {
        store: Arc<IdempotencyStore>,
        healthy: AtomicBool,
        connected: AtomicBool,
        response: Value,
        fail_attempts: AtomicU32,
        abort: AtomicBool,
        dispatches: AtomicU32,
    }

    impl LoopbackTransport {
        fn new(store: Arc<IdempotencyStore>, response: Value) -> Self {
            Self {
                store,
                healthy: AtomicBool::new(true),
                connected: AtomicBool::new(true),
                response,
                fail_attempts: AtomicU32::new(0),
                abort: AtomicBool::new(false),
                dispatches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ServiceTransport for LoopbackTransport {
        async fn dispatch(
            &self,
            service_id: &str,
            frame: OutboundFrame,
        ) -> Result<(), TransportError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected(service_id.to_string()));
            }
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            let OutboundFrame::TaskRequest {
                idempotency_key,
                execution_id,
                ..
            } = frame
            else {
                return Ok(());
            };
            if self.abort.load(Ordering::SeqCst) {
                self.store
                    .track_abort_result(
                        &idempotency_key,
                        &execution_id,
                        serde_json::to_vec(&json!({"reason": "user abort"})).unwrap(),
                    )
                    .await;
            } else if self.fail_attempts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v > 0).then(|| v - 1)
            })
            .is_ok()
            {
                self.store
                    .update_execution_result(
                        &idempotency_key,
                        &execution_id,
                        None,
                        Some("service blew up".into()),
                    )
                    .await;
            } else {
                self.store
                    .update_execution_result(
                        &idempotency_key,
                        &execution_id,
                        Some(serde_json::to_vec(&self.response).unwrap()),
                        None,
                    )
                    .await;
            }
            Ok(())
        }

        async fn is_service_healthy(&self, _service_id: &str) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn echo_service(revertible: bool) -> Service {
        let mut props = std::collections::BTreeMap::new();
        props.insert("message".to_string(), Schema::of_kind("string"));
        let mut service = Service::new(
            "p1",
            "echo-service",
            ServiceKind::Service,
            "Echoes a message back",
            ServiceSchema {
                input: Schema::object(props.clone()),
                output: Schema::object(props),
            },
            revertible,
        );
        service.id = "s_echo".into();
        service
    }

    struct Fixture {
        ctx: Arc<TaskWorkerContext>,
        store: Arc<IdempotencyStore>,
        transport: Arc<LoopbackTransport>,
        log: Arc<Log>,
    }

    async fn fixture(response: Value) -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let log_manager = Arc::new(LogManager::new(storage));
        let log = log_manager
            .create_log("o1", "p1", Some(ExecutionPlan::default()))
            .await
            .unwrap();
        let store = Arc::new(IdempotencyStore::default());
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&store), response));
        let ctx = Arc::new(TaskWorkerContext {
            orchestration_id: "o1".into(),
            log: Arc::clone(&log),
            log_manager,
            transport: transport.clone(),
            task_timeout: Duration::from_secs(5),
            health_grace_period: Duration::from_secs(60),
        });
        Fixture {
            ctx,
            store,
            transport,
            log,
        }
    }

    fn echo_task() -> SubTask {
        let mut task = SubTask::new("task1", "s_echo");
        task.input = json!({"message": "$task0.message"})
            .as_object()
            .cloned()
            .unwrap();
        task
    }

    async fn seed_task_zero(log: &Arc<Log>) {
        let entry = LogEntry::new(
            EntryType::TaskOutput,
            "task0",
            serde_json::to_vec(&json!({"message": "Hello World"})).unwrap(),
            "plan_engine",
            0,
        );
        log.append(entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_happy_path_appends_output() {
        let fx = fixture(json!({"task": {"message": "Hello World"}})).await;
        seed_task_zero(&fx.log).await;

        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(false),
            Arc::clone(&fx.store),
        );
        worker.run(CancellationToken::new()).await;

        let outputs = fx.log.entries_of_type(EntryType::TaskOutput).await;
        let task1 = outputs.iter().find(|e| e.id == "task1").expect("task1 output");
        let value: Value = serde_json::from_slice(&task1.value).unwrap();
        assert_eq!(value["message"], "Hello World");
        assert!(fx.log.entries_of_type(EntryType::CompensationStored).await.is_empty());
    }

    #[tokio::test]
    async fn test_revertible_service_stores_compensation() {
        let fx = fixture(json!({
            "task": {"message": "Hello"},
            "compensation": {"input": {"undo": true}, "ttl_ms": 60000}
        }))
        .await;
        seed_task_zero(&fx.log).await;

        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(true),
            Arc::clone(&fx.store),
        );
        worker.run(CancellationToken::new()).await;

        let stored = fx.log.entries_of_type(EntryType::CompensationStored).await;
        assert_eq!(stored.len(), 1);
        let data: CompensationData = serde_json::from_slice(&stored[0].value).unwrap();
        assert_eq!(data.input["undo"], true);
        assert_eq!(data.ttl_ms, 60000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_appends_failure() {
        let fx = fixture(json!({"task": {}})).await;
        fx.transport.fail_attempts.store(u32::MAX, Ordering::SeqCst);
        seed_task_zero(&fx.log).await;

        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(false),
            Arc::clone(&fx.store),
        );
        tokio::time::timeout(Duration::from_secs(120), worker.run(CancellationToken::new()))
            .await
            .expect("worker should terminate");

        let failures = fx.log.entries_of_type(EntryType::TaskFailure).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt_num, MAX_TASK_RETRIES);
        let body: Value = serde_json::from_slice(&failures[0].value).unwrap();
        assert_eq!(body["id"], "task1");
        // No task_output for task1.
        assert!(fx
            .log
            .entries_of_type(EntryType::TaskOutput)
            .await
            .iter()
            .all(|e| e.id != "task1"));
    }

    #[tokio::test]
    async fn test_abort_appends_aborted_output() {
        let fx = fixture(json!({})).await;
        fx.transport.abort.store(true, Ordering::SeqCst);
        seed_task_zero(&fx.log).await;

        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(false),
            Arc::clone(&fx.store),
        );
        worker.run(CancellationToken::new()).await;

        let aborted = fx.log.entries_of_type(EntryType::TaskAbortedOutput).await;
        assert_eq!(aborted.len(), 1);
        let payload: Value = serde_json::from_slice(&aborted[0].value).unwrap();
        assert_eq!(payload["reason"], "user abort");
        assert!(fx
            .log
            .entries_of_type(EntryType::TaskOutput)
            .await
            .iter()
            .all(|e| e.id != "task1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_service_pauses_then_recovers() {
        let fx = fixture(json!({"task": {"message": "Hello"}})).await;
        fx.transport.healthy.store(false, Ordering::SeqCst);
        seed_task_zero(&fx.log).await;

        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(false),
            Arc::clone(&fx.store),
        );
        let transport = Arc::clone(&fx.transport);
        let handle = tokio::spawn(worker.run(CancellationToken::new()));

        // Let the worker observe the unhealthy service, then recover it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        transport.healthy.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("worker should finish")
            .unwrap();

        let statuses: Vec<TaskStatusPayload> = fx
            .log
            .entries_of_type(EntryType::TaskStatus)
            .await
            .iter()
            .map(|e| serde_json::from_slice(&e.value).unwrap())
            .collect();
        assert!(statuses.iter().any(|s| s.status == Status::Paused));
        assert!(statuses.iter().any(|s| s.status == Status::Completed));
        let outputs = fx.log.entries_of_type(EntryType::TaskOutput).await;
        assert!(outputs.iter().any(|e| e.id == "task1"));
    }

    #[tokio::test]
    async fn test_idempotency_key_stable_and_distinct() {
        let input = json!({"b": 2, "a": 1});
        let same = json!({"a": 1, "b": 2});
        assert_eq!(
            idempotency_key("o1", "task1", &input),
            idempotency_key("o1", "task1", &same)
        );
        assert_ne!(
            idempotency_key("o1", "task1", &input),
            idempotency_key("o1", "task2", &input)
        );
        assert_ne!(
            idempotency_key("o1", "task1", &input),
            idempotency_key("o2", "task1", &input)
        );
    }

    #[tokio::test]
    async fn test_cancelled_worker_appends_nothing() {
        let fx = fixture(json!({"task": {}})).await;
        seed_task_zero(&fx.log).await;
        let baseline = fx.log.len().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = TaskWorker::new(
            Arc::clone(&fx.ctx),
            echo_task(),
            echo_service(false),
            Arc::clone(&fx.store),
        );
        worker.run(cancel).await;
        assert_eq!(fx.log.len().await, baseline);
    }
}
