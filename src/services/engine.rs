//! The plan engine coordinator.
//!
//! Owns the project/service/orchestration/grounding registries, drives plan
//! preparation, spawns the worker set per orchestration, finalizes terminal
//! outcomes, and routes inbound service results into the per-service
//! idempotency stores. A single engine instance owns every orchestration it
//! prepares.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::plan::TASK_ZERO;
use crate::domain::models::{
    Action, ActionParam, EntryType, GroundingSpec, LogEntry, Orchestration, Project, Service,
    Status,
};
use crate::domain::ports::embedding::EmbeddingClient;
use crate::domain::ports::plan_validator::PlanValidator;
use crate::domain::ports::reasoning::ReasoningClient;
use crate::domain::ports::storage::Storage;
use crate::domain::ports::transport::{result_type, ServiceTransport, TaskResult};
use crate::services::compensation::{collect_candidates, CompensationWorker};
use crate::services::idempotency::{IdempotencyStore, PauseReason};
use crate::services::incident_tracker::IncidentTracker;
use crate::services::log::LogManager;
use crate::services::preparation::PlanPreparer;
use crate::services::result_aggregator::ResultAggregator;
use crate::services::task_worker::{TaskWorker, TaskWorkerContext};
use crate::services::vector_cache::VectorCache;
use crate::services::webhooks::{CompletionEvent, WebhookNotifier};

/// Error code stamped on orchestrations cancelled at shutdown.
pub const CANCELLED_ERROR_CODE: &str = "ORCHESTRATION_CANCELLED";

/// Producer id of engine-written log entries.
const ENGINE_PRODUCER: &str = "plan_engine";

/// Callback log watchers use to finalize an orchestration.
#[async_trait]
pub trait OrchestrationFinalizer: Send + Sync {
    async fn finalize(
        &self,
        orchestration_id: &str,
        status: Status,
        error: Option<Value>,
        results: Vec<Value>,
        abort_payload: Option<Value>,
    );
}

struct RegisteredService {
    service: Service,
    store: Arc<IdempotencyStore>,
}

/// The coordinator at the center of the engine.
pub struct PlanEngine {
    /// Self-handle so spawned watchers can call back into `finalize`.
    weak_self: Weak<PlanEngine>,
    storage: Arc<dyn Storage>,
    log_manager: Arc<LogManager>,
    transport: Arc<dyn ServiceTransport>,
    preparer: PlanPreparer,
    notifier: WebhookNotifier,
    projects: RwLock<HashMap<String, Project>>,
    services: RwLock<HashMap<String, RegisteredService>>,
    orchestrations: RwLock<HashMap<String, Orchestration>>,
    groundings: RwLock<HashMap<String, Vec<GroundingSpec>>>,
    workers: Mutex<HashMap<String, Vec<CancellationToken>>>,
    shutdown: CancellationToken,
}

impl PlanEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn ServiceTransport>,
        reasoning: Arc<dyn ReasoningClient>,
        embedding: Arc<dyn EmbeddingClient>,
        validator: Arc<dyn PlanValidator>,
    ) -> Arc<Self> {
        let log_manager = Arc::new(LogManager::new(Arc::clone(&storage)));
        let preparer = PlanPreparer::new(
            reasoning,
            embedding,
            validator,
            Arc::new(VectorCache::default()),
        );
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            storage,
            log_manager,
            transport,
            preparer,
            notifier: WebhookNotifier::new(),
            projects: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            orchestrations: RwLock::new(HashMap::new()),
            groundings: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    // ------------------------------------------------------------------
    // Project registry
    // ------------------------------------------------------------------

    /// Register a project; persists the record plus its api-key index.
    pub async fn register_project(&self, webhook: Option<String>) -> EngineResult<Project> {
        let project = Project::new(webhook);
        self.persist_project(&project).await?;
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        info!(project_id = %project.id, "project registered");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Option<Project> {
        self.projects.read().await.get(project_id).cloned()
    }

    /// Resolve an API key to its project.
    pub async fn project_by_api_key(&self, api_key: &str) -> Option<Project> {
        let projects = self.projects.read().await;
        projects
            .values()
            .find(|p| p.accepts_key(api_key))
            .cloned()
    }

    pub async fn add_project_webhook(&self, project_id: &str, url: String) -> EngineResult<()> {
        self.mutate_project(project_id, |p| p.add_webhook(url)).await
    }

    pub async fn add_compensation_failure_webhook(
        &self,
        project_id: &str,
        url: String,
    ) -> EngineResult<()> {
        self.mutate_project(project_id, |p| p.add_compensation_failure_webhook(url))
            .await
    }

    /// Mint an additional API key for the project.
    pub async fn add_project_api_key(&self, project_id: &str) -> EngineResult<String> {
        let mut key = String::new();
        self.mutate_project(project_id, |p| key = p.add_api_key())
            .await?;
        Ok(key)
    }

    async fn mutate_project(
        &self,
        project_id: &str,
        mutate: impl FnOnce(&mut Project),
    ) -> EngineResult<()> {
        let updated = {
            let projects = self.projects.read().await;
            let Some(project) = projects.get(project_id) else {
                return Err(EngineError::ProjectNotFound(project_id.to_string()));
            };
            let mut updated = project.clone();
            mutate(&mut updated);
            updated
        };
        self.persist_project(&updated).await?;
        self.projects
            .write()
            .await
            .insert(project_id.to_string(), updated);
        Ok(())
    }

    async fn persist_project(&self, project: &Project) -> EngineResult<()> {
        let bytes = serde_json::to_vec(project)?;
        self.storage
            .put(&format!("project:info:{}", project.id), bytes)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        for key in project.all_api_keys() {
            self.storage
                .put(
                    &format!("project:apikey:{key}"),
                    project.id.clone().into_bytes(),
                )
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Service registry
    // ------------------------------------------------------------------

    /// Register a service. Re-registering an existing `{project, name}`
    /// bumps the version and replaces the mutable fields; the service keeps
    /// its id and idempotency store.
    pub async fn register_service(&self, incoming: Service) -> EngineResult<Service> {
        let mut services = self.services.write().await;
        let existing_id = services
            .values()
            .find(|r| {
                r.service.project_id == incoming.project_id && r.service.name == incoming.name
            })
            .map(|r| r.service.id.clone());

        let service = if let Some(id) = existing_id {
            let registered = services.get_mut(&id).expect("service present");
            registered.service.apply_update(incoming);
            registered.service.clone()
        } else {
            let service = incoming;
            services.insert(
                service.id.clone(),
                RegisteredService {
                    service: service.clone(),
                    store: Arc::new(IdempotencyStore::default()),
                },
            );
            service
        };
        drop(services);

        let bytes = serde_json::to_vec(&service)?;
        self.storage
            .put(
                &format!("service:{}:{}", service.project_id, service.id),
                bytes,
            )
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!(
            service_id = %service.id,
            name = %service.name,
            version = service.version,
            "service registered"
        );
        Ok(service)
    }

    pub async fn get_service(&self, service_id: &str) -> Option<Service> {
        self.services
            .read()
            .await
            .get(service_id)
            .map(|r| r.service.clone())
    }

    /// The service's idempotency store; inbound results are applied here.
    pub async fn idempotency_store(&self, service_id: &str) -> Option<Arc<IdempotencyStore>> {
        self.services
            .read()
            .await
            .get(service_id)
            .map(|r| Arc::clone(&r.store))
    }

    pub async fn services_for_project(&self, project_id: &str) -> HashMap<String, Service> {
        self.services
            .read()
            .await
            .values()
            .filter(|r| r.service.project_id == project_id)
            .map(|r| (r.service.id.clone(), r.service.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Grounding registry
    // ------------------------------------------------------------------

    pub async fn register_grounding(&self, spec: GroundingSpec) -> EngineResult<()> {
        let bytes = serde_json::to_vec(&spec)?;
        self.storage
            .put(
                &format!("grounding:{}:{}", spec.project_id, spec.name),
                bytes,
            )
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let mut groundings = self.groundings.write().await;
        let list = groundings.entry(spec.project_id.clone()).or_default();
        list.retain(|g| g.name != spec.name);
        list.push(spec);
        Ok(())
    }

    pub async fn remove_grounding(&self, project_id: &str, name: &str) -> EngineResult<()> {
        self.storage
            .delete(&format!("grounding:{project_id}:{name}"))
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if let Some(list) = self.groundings.write().await.get_mut(project_id) {
            list.retain(|g| g.name != name);
        }
        Ok(())
    }

    pub async fn groundings_for_project(&self, project_id: &str) -> Vec<GroundingSpec> {
        self.groundings
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Orchestration lifecycle
    // ------------------------------------------------------------------

    pub async fn get_orchestration(&self, orchestration_id: &str) -> Option<Orchestration> {
        self.orchestrations
            .read()
            .await
            .get(orchestration_id)
            .cloned()
    }

    /// Prepare an orchestration for the action. The returned orchestration
    /// is `Pending` with a validated plan, or terminal (`Failed` /
    /// `NotActionable`) with a JSON error.
    pub async fn prepare_orchestration(
        &self,
        project_id: &str,
        action: Action,
        params: Vec<ActionParam>,
        timeout_ms: Option<u64>,
        health_check_grace_period_ms: Option<u64>,
    ) -> EngineResult<Orchestration> {
        let Some(project) = self.get_project(project_id).await else {
            return Err(EngineError::ProjectNotFound(project_id.to_string()));
        };

        let mut orchestration = Orchestration::new(project_id, action, params);
        if let Some(timeout) = timeout_ms {
            orchestration.timeout_ms = timeout;
        }
        if let Some(grace) = health_check_grace_period_ms {
            orchestration.health_check_grace_period_ms = grace;
        }

        let services = self.services_for_project(project_id).await;
        let groundings = self.groundings_for_project(project_id).await;

        let outcome = self
            .preparer
            .prepare(&mut orchestration, &services, &project, &groundings)
            .await;

        self.persist_orchestration(&orchestration).await?;
        self.orchestrations
            .write()
            .await
            .insert(orchestration.id.clone(), orchestration.clone());

        if let Err(err) = outcome {
            // Preparation failures are terminal; notify like any other
            // terminal state.
            let event = CompletionEvent::new(
                &orchestration.project_id,
                &orchestration.id,
                orchestration.status,
                None,
                orchestration.error.clone(),
                None,
            );
            let notifier = self.notifier.clone();
            let urls = project.webhooks.clone();
            tokio::spawn(async move { notifier.notify_completion(&urls, &event).await });
            debug!(
                orchestration_id = %orchestration.id,
                error = %err,
                "preparation ended terminally"
            );
        }
        Ok(orchestration)
    }

    /// Execute a prepared orchestration: open its log, seed `task0`, and
    /// spawn the worker set.
    pub async fn execute(&self, orchestration_id: &str) -> EngineResult<()> {
        let orchestration = {
            let mut orchestrations = self.orchestrations.write().await;
            let Some(orchestration) = orchestrations.get_mut(orchestration_id) else {
                return Err(EngineError::OrchestrationNotFound(
                    orchestration_id.to_string(),
                ));
            };
            if orchestration.status != Status::Pending {
                return Err(EngineError::Validation(format!(
                    "orchestration {orchestration_id} is {} and cannot execute",
                    orchestration.status.as_str()
                )));
            }
            if orchestration.plan.is_none() {
                return Err(EngineError::Validation(format!(
                    "orchestration {orchestration_id} has no plan"
                )));
            }
            orchestration.status = Status::Processing;
            orchestration.timestamp = chrono::Utc::now();
            orchestration.clone()
        };
        self.persist_orchestration(&orchestration).await?;

        let Some(plan) = orchestration.plan.clone() else {
            return Err(EngineError::Validation(format!(
                "orchestration {orchestration_id} has no plan"
            )));
        };
        let log = self
            .log_manager
            .create_log(
                &orchestration.id,
                &orchestration.project_id,
                Some(plan.clone()),
            )
            .await?;

        let task_zero = orchestration.task_zero.clone().unwrap_or(Value::Null);
        let entry = LogEntry::new(
            EntryType::TaskOutput,
            TASK_ZERO,
            serde_json::to_vec(&task_zero)?,
            ENGINE_PRODUCER,
            0,
        );
        log.append(entry).await?;

        self.spawn_workers(&orchestration).await?;
        info!(orchestration_id = %orchestration.id, "orchestration executing");
        Ok(())
    }

    /// Spawn one task worker per executable task plus the aggregator and
    /// incident tracker, all cancellable under the orchestration id.
    async fn spawn_workers(&self, orchestration: &Orchestration) -> EngineResult<()> {
        let plan = orchestration
            .plan
            .clone()
            .ok_or_else(|| EngineError::Validation("orchestration has no plan".into()))?;
        let log = self
            .log_manager
            .get_log(&orchestration.id)
            .await
            .ok_or_else(|| {
                EngineError::OrchestrationNotFound(orchestration.id.clone())
            })?;

        let ctx = Arc::new(TaskWorkerContext {
            orchestration_id: orchestration.id.clone(),
            log: Arc::clone(&log),
            log_manager: Arc::clone(&self.log_manager),
            transport: Arc::clone(&self.transport),
            task_timeout: Duration::from_millis(orchestration.timeout_ms),
            health_grace_period: Duration::from_millis(
                orchestration.health_check_grace_period_ms,
            ),
        });

        let mut tokens = Vec::new();
        {
            let services = self.services.read().await;
            for task in plan.executable_tasks() {
                let Some(registered) = services.get(&task.service) else {
                    return Err(EngineError::ServiceNotFound(task.service.clone()));
                };
                let worker = TaskWorker::new(
                    Arc::clone(&ctx),
                    task.clone(),
                    registered.service.clone(),
                    Arc::clone(&registered.store),
                );
                let token = self.shutdown.child_token();
                tokens.push(token.clone());
                tokio::spawn(worker.run(token));
            }
        }

        let dependencies: Vec<String> =
            plan.executable_tasks().map(|t| t.id.clone()).collect();
        let finalizer: Arc<dyn OrchestrationFinalizer> = self
            .weak_self
            .upgrade()
            .ok_or_else(|| EngineError::Validation("engine is shutting down".into()))?;

        let aggregator = ResultAggregator::new(
            &orchestration.id,
            Arc::clone(&log),
            Arc::clone(&self.log_manager),
            dependencies,
            Arc::clone(&finalizer),
        );
        let token = self.shutdown.child_token();
        tokens.push(token.clone());
        tokio::spawn(aggregator.run(token));

        let tracker = IncidentTracker::new(
            &orchestration.id,
            Arc::clone(&log),
            Arc::clone(&self.log_manager),
            finalizer,
        );
        let token = self.shutdown.child_token();
        tokens.push(token.clone());
        tokio::spawn(tracker.run(token));

        self.workers
            .lock()
            .await
            .insert(orchestration.id.clone(), tokens);
        Ok(())
    }

    async fn cancel_workers(&self, orchestration_id: &str) {
        if let Some(tokens) = self.workers.lock().await.remove(orchestration_id) {
            for token in tokens {
                token.cancel();
            }
        }
    }

    /// Transition every `Processing` orchestration to `Cancelled`; used at
    /// shutdown.
    pub async fn cancel_all(&self) {
        let processing: Vec<String> = {
            let orchestrations = self.orchestrations.read().await;
            orchestrations
                .values()
                .filter(|o| o.status == Status::Processing)
                .map(|o| o.id.clone())
                .collect()
        };
        for orchestration_id in processing {
            self.finalize(
                &orchestration_id,
                Status::Cancelled,
                Some(json!({
                    "code": CANCELLED_ERROR_CODE,
                    "error": "engine shut down while the orchestration was processing",
                })),
                Vec::new(),
                None,
            )
            .await;
        }
    }

    /// Cancel everything and close the storage.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.cancel_all().await;
        self.shutdown.cancel();
        if let Err(err) = self.storage.close().await {
            warn!(error = %err, "storage close failed");
        }
    }

    // ------------------------------------------------------------------
    // Inbound result routing
    // ------------------------------------------------------------------

    /// Apply a service-sent result to the owning idempotency store.
    pub async fn apply_task_result(&self, result: TaskResult) {
        let Some(store) = self.idempotency_store(&result.service_id).await else {
            warn!(
                service_id = %result.service_id,
                "result for unknown service dropped"
            );
            return;
        };
        let key = &result.idempotency_key;
        let execution_id = &result.execution_id;
        let accepted = match result.kind.as_str() {
            result_type::TASK_RESULT => {
                if let Some(error) = result.error {
                    store
                        .update_execution_result(key, execution_id, None, Some(error))
                        .await
                } else {
                    let bytes = result
                        .result
                        .as_ref()
                        .and_then(|v| serde_json::to_vec(v).ok())
                        .unwrap_or_default();
                    store
                        .update_execution_result(key, execution_id, Some(bytes), None)
                        .await
                }
            }
            result_type::TASK_INTERIM_RESULT => {
                let bytes = result
                    .result
                    .as_ref()
                    .and_then(|v| serde_json::to_vec(v).ok())
                    .unwrap_or_default();
                store.track_interim_result(key, execution_id, bytes).await
            }
            result_type::TASK_ABORT_RESULT => {
                let bytes = result
                    .result
                    .as_ref()
                    .and_then(|v| serde_json::to_vec(v).ok())
                    .unwrap_or_default();
                store.track_abort_result(key, execution_id, bytes).await
            }
            result_type::TASK_STATUS => {
                if result
                    .status
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case("paused"))
                {
                    // The service itself parked the execution; it still
                    // holds the request, so the worker only observes.
                    store
                        .pause_execution(key, PauseReason::AwaitingResult)
                        .await;
                }
                true
            }
            result_type::PONG => true,
            other => {
                debug!(kind = other, "unrecognized result type ignored");
                true
            }
        };
        if !accepted {
            debug!(
                service_id = %result.service_id,
                execution_id = %execution_id,
                "stale or settled execution result dropped"
            );
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Reload registries and logs from storage; resume orchestrations that
    /// were mid-flight when the process stopped.
    pub async fn recover(&self) -> EngineResult<()> {
        for (key, bytes) in self
            .storage
            .list_prefix("project:info:")
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            match serde_json::from_slice::<Project>(&bytes) {
                Ok(project) => {
                    self.projects
                        .write()
                        .await
                        .insert(project.id.clone(), project);
                }
                Err(err) => warn!(%key, error = %err, "skipping unparseable project"),
            }
        }

        for (key, bytes) in self
            .storage
            .list_prefix("service:")
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            match serde_json::from_slice::<Service>(&bytes) {
                Ok(service) => {
                    self.services.write().await.insert(
                        service.id.clone(),
                        RegisteredService {
                            service,
                            store: Arc::new(IdempotencyStore::default()),
                        },
                    );
                }
                Err(err) => warn!(%key, error = %err, "skipping unparseable service"),
            }
        }

        for (key, bytes) in self
            .storage
            .list_prefix("grounding:")
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            match serde_json::from_slice::<GroundingSpec>(&bytes) {
                Ok(spec) => {
                    self.groundings
                        .write()
                        .await
                        .entry(spec.project_id.clone())
                        .or_default()
                        .push(spec);
                }
                Err(err) => warn!(%key, error = %err, "skipping unparseable grounding"),
            }
        }

        for (key, bytes) in self
            .storage
            .list_prefix("orchestration:info:")
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            match serde_json::from_slice::<Orchestration>(&bytes) {
                Ok(orchestration) => {
                    self.orchestrations
                        .write()
                        .await
                        .insert(orchestration.id.clone(), orchestration);
                }
                Err(err) => warn!(%key, error = %err, "skipping unparseable orchestration"),
            }
        }

        let recovered = self.log_manager.recover().await?;
        for state in recovered {
            if state.status != Status::Processing {
                continue;
            }
            let Some(orchestration) = self.get_orchestration(&state.id).await else {
                warn!(orchestration_id = %state.id, "processing state without orchestration");
                continue;
            };
            if orchestration.status.is_terminal() {
                continue;
            }
            info!(orchestration_id = %state.id, "resuming recovered orchestration");
            if let Err(err) = self.spawn_workers(&orchestration).await {
                error!(
                    orchestration_id = %state.id,
                    error = %err,
                    "failed to resume orchestration"
                );
            }
        }
        Ok(())
    }

    async fn persist_orchestration(&self, orchestration: &Orchestration) -> EngineResult<()> {
        let bytes = serde_json::to_vec(orchestration)?;
        self.storage
            .put(&format!("orchestration:info:{}", orchestration.id), bytes)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.storage
            .put(
                &format!(
                    "orchestration:project:{}:{}",
                    orchestration.project_id, orchestration.id
                ),
                orchestration.id.clone().into_bytes(),
            )
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl OrchestrationFinalizer for PlanEngine {
    /// Atomically rewrite terminal fields, fire webhooks, cancel workers,
    /// and kick off compensation for failed/aborted orchestrations.
    ///
    /// A second finalize against an already-terminal orchestration may only
    /// update error, results, abort payload, and timestamp; the status is
    /// frozen.
    async fn finalize(
        &self,
        orchestration_id: &str,
        status: Status,
        error: Option<Value>,
        results: Vec<Value>,
        abort_payload: Option<Value>,
    ) {
        let (orchestration, effective_status) = {
            let mut orchestrations = self.orchestrations.write().await;
            let Some(orchestration) = orchestrations.get_mut(orchestration_id) else {
                warn!(orchestration_id, "finalize for unknown orchestration");
                return;
            };
            let frozen = orchestration.status.is_terminal();
            if !frozen {
                orchestration.status = status;
            }
            if error.is_some() {
                orchestration.error = error.clone();
            }
            if !results.is_empty() {
                orchestration.results = results.clone();
            }
            if abort_payload.is_some() {
                orchestration.abort_payload = abort_payload.clone();
            }
            orchestration.timestamp = chrono::Utc::now();
            (orchestration.clone(), orchestration.status)
        };

        if let Err(err) = self.persist_orchestration(&orchestration).await {
            error!(orchestration_id, error = %err, "failed to persist finalized orchestration");
        }
        let _ = self
            .log_manager
            .mark_orchestration_status(
                orchestration_id,
                effective_status,
                orchestration.error.as_ref().map(ToString::to_string),
            )
            .await;

        info!(
            orchestration_id,
            status = effective_status.as_str(),
            "orchestration finalized"
        );

        if let Some(project) = self.get_project(&orchestration.project_id).await {
            let event = CompletionEvent::new(
                &orchestration.project_id,
                orchestration_id,
                effective_status,
                (!orchestration.results.is_empty()).then(|| orchestration.results.clone()),
                orchestration.error.clone(),
                orchestration.abort_payload.clone(),
            );
            let notifier = self.notifier.clone();
            let urls = project.webhooks.clone();
            tokio::spawn(async move { notifier.notify_completion(&urls, &event).await });
        }

        self.cancel_workers(orchestration_id).await;

        if effective_status.needs_compensation() {
            self.start_compensation(&orchestration, effective_status)
                .await;
        }
    }
}

impl PlanEngine {
    async fn start_compensation(&self, orchestration: &Orchestration, status: Status) {
        let Some(plan) = orchestration.plan.as_ref() else {
            return;
        };
        let Some(log) = self.log_manager.get_log(&orchestration.id).await else {
            return;
        };

        let services: HashMap<String, (Service, Arc<IdempotencyStore>)> = {
            let registered = self.services.read().await;
            registered
                .values()
                .map(|r| (r.service.id.clone(), (r.service.clone(), Arc::clone(&r.store))))
                .collect()
        };

        let candidates = collect_candidates(&log, plan, &services).await;
        if candidates.is_empty() {
            return;
        }
        info!(
            orchestration_id = %orchestration.id,
            candidates = candidates.len(),
            "starting compensation"
        );

        let stores: HashMap<String, Arc<IdempotencyStore>> = services
            .into_iter()
            .map(|(id, (_, store))| (id, store))
            .collect();
        let webhook_urls = self
            .get_project(&orchestration.project_id)
            .await
            .map(|p| p.compensation_failure_webhooks)
            .unwrap_or_default();

        let worker = CompensationWorker::new(
            &orchestration.id,
            &orchestration.project_id,
            format!("orchestration {}", status.as_str()),
            candidates,
            log,
            Arc::clone(&self.storage),
            Arc::clone(&self.transport),
            stores,
            self.notifier.clone(),
            webhook_urls,
        );
        let token = self.shutdown.child_token();
        self.workers
            .lock()
            .await
            .entry(orchestration.id.clone())
            .or_default()
            .push(token.clone());
        tokio::spawn(worker.run(token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Schema, ServiceKind, ServiceSchema};
    use crate::domain::ports::plan_validator::AcceptAllValidator;
    use crate::domain::ports::reasoning::ScriptedReasoningClient;
    use crate::domain::ports::storage::InMemoryStorage;
    use crate::domain::ports::transport::{OutboundFrame, TransportError};
    use crate::domain::ports::TrigramEmbeddingClient;

    struct NullTransport;

    #[async_trait]
    impl ServiceTransport for NullTransport {
        async fn dispatch(
            &self,
            service_id: &str,
            _frame: OutboundFrame,
        ) -> Result<(), TransportError> {
            Err(TransportError::NotConnected(service_id.to_string()))
        }

        async fn is_service_healthy(&self, _service_id: &str) -> bool {
            false
        }
    }

    fn engine() -> Arc<PlanEngine> {
        PlanEngine::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(NullTransport),
            Arc::new(ScriptedReasoningClient::default()),
            Arc::new(TrigramEmbeddingClient::default()),
            Arc::new(AcceptAllValidator),
        )
    }

    fn service(project_id: &str, name: &str) -> Service {
        let mut props = std::collections::BTreeMap::new();
        props.insert("message".to_string(), Schema::of_kind("string"));
        Service::new(
            project_id,
            name,
            ServiceKind::Service,
            "Echoes a message back",
            ServiceSchema {
                input: Schema::object(props.clone()),
                output: Schema::object(props),
            },
            false,
        )
    }

    #[tokio::test]
    async fn test_project_registration_and_key_lookup() {
        let engine = engine();
        let project = engine
            .register_project(Some("https://example.com/hook".into()))
            .await
            .unwrap();
        let found = engine.project_by_api_key(&project.api_key).await.unwrap();
        assert_eq!(found.id, project.id);

        let extra = engine.add_project_api_key(&project.id).await.unwrap();
        let found = engine.project_by_api_key(&extra).await.unwrap();
        assert_eq!(found.id, project.id);

        assert!(engine.project_by_api_key("sk-orra-nope").await.is_none());
    }

    #[tokio::test]
    async fn test_service_reregistration_bumps_version() {
        let engine = engine();
        let project = engine.register_project(None).await.unwrap();
        let first = engine
            .register_service(service(&project.id, "echo"))
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let mut update = service(&project.id, "echo");
        update.description = "Echoes twice".into();
        let second = engine.register_service(update).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.version, 2);
        assert_eq!(second.description, "Echoes twice");

        let catalogue = engine.services_for_project(&project.id).await;
        assert_eq!(catalogue.len(), 1);
    }

    #[tokio::test]
    async fn test_grounding_registry_roundtrip() {
        let engine = engine();
        let project = engine.register_project(None).await.unwrap();
        let spec = GroundingSpec {
            project_id: project.id.clone(),
            name: "delivery".into(),
            domain: "delivery".into(),
            version: "1.0".into(),
            use_cases: vec![],
            constraints: vec![],
            created_at: chrono::Utc::now(),
        };
        engine.register_grounding(spec.clone()).await.unwrap();
        assert_eq!(engine.groundings_for_project(&project.id).await.len(), 1);
        engine
            .remove_grounding(&project.id, "delivery")
            .await
            .unwrap();
        assert!(engine.groundings_for_project(&project.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_terminal_lock() {
        let engine = engine();
        let project = engine
            .register_project(Some("https://example.invalid/hook".into()))
            .await
            .unwrap();
        let orchestration = Orchestration::new(
            &project.id,
            Action {
                kind: "user".into(),
                content: "echo".into(),
            },
            vec![],
        );
        let id = orchestration.id.clone();
        engine
            .orchestrations
            .write()
            .await
            .insert(id.clone(), orchestration);
        engine.log_manager.create_log(&id, &project.id, None).await.unwrap();

        engine
            .finalize(&id, Status::Completed, None, vec![json!({"ok": true})], None)
            .await;
        assert_eq!(
            engine.get_orchestration(&id).await.unwrap().status,
            Status::Completed
        );

        // A later finalize may not change the status, only the mutable
        // terminal fields.
        engine
            .finalize(&id, Status::Failed, Some(json!({"error": "late"})), vec![], None)
            .await;
        let after = engine.get_orchestration(&id).await.unwrap();
        assert_eq!(after.status, Status::Completed);
        assert_eq!(after.error.as_ref().unwrap()["error"], "late");
    }

    #[tokio::test]
    async fn test_cancel_all_marks_processing_cancelled() {
        let engine = engine();
        let project = engine.register_project(None).await.unwrap();
        let mut orchestration = Orchestration::new(
            &project.id,
            Action {
                kind: "user".into(),
                content: "echo".into(),
            },
            vec![],
        );
        orchestration.status = Status::Processing;
        let id = orchestration.id.clone();
        engine
            .orchestrations
            .write()
            .await
            .insert(id.clone(), orchestration);
        engine.log_manager.create_log(&id, &project.id, None).await.unwrap();

        engine.cancel_all().await;
        let after = engine.get_orchestration(&id).await.unwrap();
        assert_eq!(after.status, Status::Cancelled);
        assert_eq!(after.error.as_ref().unwrap()["code"], CANCELLED_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_execute_requires_pending_plan() {
        let engine = engine();
        let project = engine.register_project(None).await.unwrap();
        let orchestration = Orchestration::new(
            &project.id,
            Action {
                kind: "user".into(),
                content: "echo".into(),
            },
            vec![],
        );
        let id = orchestration.id.clone();
        engine
            .orchestrations
            .write()
            .await
            .insert(id.clone(), orchestration);

        let err = engine.execute(&id).await.unwrap_err();
        assert!(err.to_string().contains("no plan"));
    }
}
