//! Plan preparation pipeline.
//!
//! Turns an action + params + service catalogue into a validated execution
//! plan: embed the action, probe the vector cache, otherwise prompt the
//! generator and validate/normalize what comes back. Retryable validation
//! failures feed progressively detailed feedback into up to three attempts;
//! permanent failures finalize the orchestration immediately.

use std::collections::HashMap;
use std::sync::Arc;

use backoff::backoff::Backoff;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::plan::TASK_ZERO;
use crate::domain::models::{
    services_hash, ActionParam, CacheEntry, ExecutionPlan, GroundingHit, GroundingSpec,
    Orchestration, Project, Service, Status,
};
use crate::domain::ports::embedding::{cosine_similarity, EmbeddingClient};
use crate::domain::ports::plan_validator::PlanValidator;
use crate::domain::ports::reasoning::ReasoningClient;
use crate::services::backoff::preparation_backoff;
use crate::services::pddl;
use crate::services::plan_validation::{
    check_param_presence, enrich_plan, lift_literals_into_task_zero,
    reject_composite_task_zero_refs, validate_subtask_io,
};
use crate::services::single_flight::SingleFlight;
use crate::services::vector_cache::{discover_mappings, VectorCache};
use crate::services::{extract_json_from_response, strip_think_block};

/// Total attempts per preparation, including the first.
pub const MAX_PREPARATION_ATTEMPTS: u32 = 3;

/// Cosine threshold for matching an action to a grounding use-case.
pub const GROUNDING_MATCH_THRESHOLD: f32 = 0.85;

/// Outcome of one successful attempt.
struct PreparedPlan {
    plan: ExecutionPlan,
    task_zero: Value,
    /// New cache entry to commit; `None` on a cache hit.
    cache_entry: Option<CacheEntry>,
}

/// The plan preparation service.
pub struct PlanPreparer {
    reasoning: Arc<dyn ReasoningClient>,
    embedding: Arc<dyn EmbeddingClient>,
    validator: Arc<dyn PlanValidator>,
    cache: Arc<VectorCache>,
    generation_flight: SingleFlight<Result<String, String>>,
}

impl PlanPreparer {
    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        embedding: Arc<dyn EmbeddingClient>,
        validator: Arc<dyn PlanValidator>,
        cache: Arc<VectorCache>,
    ) -> Self {
        Self {
            reasoning,
            embedding,
            validator,
            cache,
            generation_flight: SingleFlight::new(),
        }
    }

    pub fn cache(&self) -> &Arc<VectorCache> {
        &self.cache
    }

    /// Prepare `orchestration` against the project's catalogue.
    ///
    /// On success the orchestration holds a validated, enriched plan and is
    /// `Pending`. On failure it is terminal (`Failed` or `NotActionable`)
    /// with a JSON-encoded error, and the error is also returned.
    pub async fn prepare(
        &self,
        orchestration: &mut Orchestration,
        services: &HashMap<String, Service>,
        project: &Project,
        groundings: &[GroundingSpec],
    ) -> EngineResult<()> {
        if let Err(err) = self.check_preconditions(orchestration, services, project) {
            fail_orchestration(orchestration, &err);
            return Err(err);
        }

        match self.match_grounding(orchestration, groundings).await {
            Ok(hit) => orchestration.grounding_hit = hit,
            Err(err) => {
                fail_orchestration(orchestration, &err);
                return Err(err);
            }
        }

        let action_vector = match self
            .embedding
            .embed(&orchestration.action_with_fields())
            .await
        {
            Ok(vector) => vector,
            Err(err) => {
                fail_orchestration(orchestration, &err);
                return Err(err);
            }
        };

        let catalogue_hash = {
            let list: Vec<Service> = services.values().cloned().collect();
            services_hash(&list)
        };

        let mut policy = preparation_backoff();
        let mut feedback: Option<String> = None;
        let mut probed_entry: Option<String> = None;
        let mut attempt: u32 = 0;

        let failure = loop {
            match self
                .attempt(
                    orchestration,
                    services,
                    &action_vector,
                    &catalogue_hash,
                    attempt,
                    feedback.as_deref(),
                    &mut probed_entry,
                )
                .await
            {
                Ok(prepared) => {
                    if let Some(entry) = prepared.cache_entry {
                        self.cache.insert(&orchestration.project_id, entry).await;
                    }
                    orchestration.plan = Some(prepared.plan);
                    orchestration.task_zero = Some(prepared.task_zero);
                    orchestration.status = Status::Pending;
                    orchestration.error = None;
                    info!(
                        orchestration_id = %orchestration.id,
                        attempt,
                        "plan prepared"
                    );
                    return Ok(());
                }
                Err(err) if err.is_retryable_preparation() => {
                    warn!(
                        orchestration_id = %orchestration.id,
                        attempt,
                        error = %err,
                        "preparation attempt failed"
                    );
                    feedback = Some(err.to_string());
                    attempt += 1;
                    if attempt >= MAX_PREPARATION_ATTEMPTS {
                        break err;
                    }
                    match policy.next_backoff() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break err,
                    }
                }
                Err(err) => break err,
            }
        };

        if let Some(entry_id) = probed_entry {
            self.cache.evict(&orchestration.project_id, &entry_id).await;
        }
        fail_orchestration(orchestration, &failure);
        Err(failure)
    }

    /// Non-retryable preconditions checked before any attempt.
    fn check_preconditions(
        &self,
        orchestration: &Orchestration,
        services: &HashMap<String, Service>,
        project: &Project,
    ) -> EngineResult<()> {
        if orchestration.action.content.trim().is_empty() {
            return Err(EngineError::FailedNotRetryable(
                "action content is empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for param in &orchestration.params {
            if param.field.trim().is_empty() {
                return Err(EngineError::FailedNotRetryable(
                    "action param with empty field name".into(),
                ));
            }
            if !seen.insert(param.field.as_str()) {
                return Err(EngineError::FailedNotRetryable(format!(
                    "duplicate action param field '{}'",
                    param.field
                )));
            }
        }
        if project.webhooks.is_empty() {
            return Err(EngineError::FailedNotRetryable(
                "project has no completion webhook configured".into(),
            ));
        }
        if services.is_empty() {
            return Err(EngineError::FailedNotRetryable(
                "project has no services registered".into(),
            ));
        }
        Ok(())
    }

    /// Match the action against grounding use-cases by embedding
    /// similarity over placeholder-stripped patterns.
    async fn match_grounding(
        &self,
        orchestration: &Orchestration,
        groundings: &[GroundingSpec],
    ) -> EngineResult<Option<GroundingHit>> {
        if groundings.is_empty() {
            return Ok(None);
        }
        let action_vector = self.embedding.embed(&orchestration.action.content).await?;
        let mut best: Option<(f32, GroundingHit)> = None;
        for spec in groundings {
            for use_case in &spec.use_cases {
                let pattern_vector = self.embedding.embed(&use_case.stripped_action()).await?;
                let score = cosine_similarity(&action_vector, &pattern_vector);
                if score >= GROUNDING_MATCH_THRESHOLD
                    && best.as_ref().is_none_or(|(s, _)| score > *s)
                {
                    best = Some((
                        score,
                        GroundingHit {
                            name: spec.name.clone(),
                            domain: spec.domain.clone(),
                            version: spec.version.clone(),
                            use_case: use_case.clone(),
                            constraints: spec.constraints.clone(),
                        },
                    ));
                }
            }
        }
        if let Some((score, hit)) = &best {
            debug!(
                orchestration_id = %orchestration.id,
                use_case = %hit.use_case.action,
                score = f64::from(*score),
                "grounding use-case matched"
            );
        }
        Ok(best.map(|(_, hit)| hit))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        orchestration: &Orchestration,
        services: &HashMap<String, Service>,
        action_vector: &[f32],
        catalogue_hash: &str,
        attempt: u32,
        feedback: Option<&str>,
        probed_entry: &mut Option<String>,
    ) -> EngineResult<PreparedPlan> {
        let grounded = orchestration.grounding_hit.is_some();

        if let Some(hit) = self
            .cache
            .probe(
                &orchestration.project_id,
                action_vector,
                &orchestration.params,
                catalogue_hash,
                grounded,
            )
            .await?
        {
            *probed_entry = Some(hit.entry_id.clone());
            let plan: ExecutionPlan = serde_json::from_value(hit.plan)?;
            debug!(
                orchestration_id = %orchestration.id,
                similarity = f64::from(hit.similarity),
                "using cached plan"
            );
            return Ok(PreparedPlan {
                plan,
                task_zero: hit.task_zero,
                cache_entry: None,
            });
        }
        *probed_entry = None;

        let prompt = build_planner_prompt(orchestration, services, feedback);
        let flight_key = format!(
            "{}:{}",
            orchestration.project_id, orchestration.action.content
        );
        let reasoning = Arc::clone(&self.reasoning);
        let response = self
            .generation_flight
            .run(&flight_key, move || async move {
                reasoning
                    .generate(&prompt)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(EngineError::Reasoning)?;

        let cleaned = strip_think_block(&response);
        let json_text = extract_json_from_response(cleaned);
        let raw_plan: Value = serde_json::from_str(&json_text).map_err(|e| {
            EngineError::RetryablePreparation(format!(
                "generator returned unparseable plan JSON: {e}"
            ))
        })?;
        let mut plan: ExecutionPlan = serde_json::from_value(raw_plan).map_err(|e| {
            EngineError::RetryablePreparation(format!(
                "generator plan does not match the expected shape: {e}"
            ))
        })?;

        if let Some(error) = plan.final_task_error() {
            return Err(EngineError::NotActionable(error));
        }
        if plan.task_zero().is_none() {
            return Err(EngineError::FailedNotRetryable(
                "generated plan has no task0".into(),
            ));
        }
        plan.validate_structure()
            .map_err(EngineError::RetryablePreparation)?;

        lift_literals_into_task_zero(&mut plan);

        check_param_presence(&plan, &orchestration.params, attempt, services)
            .map_err(EngineError::RetryablePreparation)?;
        reject_composite_task_zero_refs(&plan, attempt)
            .map_err(EngineError::RetryablePreparation)?;
        validate_subtask_io(&plan, services).map_err(EngineError::RetryablePreparation)?;
        enrich_plan(&mut plan, services);

        if let Some(hit) = &orchestration.grounding_hit {
            let catalogue: Vec<Service> = services.values().cloned().collect();
            let coverage = pddl::capability_coverage(hit, &catalogue);
            if coverage < pddl::CAPABILITY_COVERAGE_REQUIRED {
                return Err(EngineError::FailedNotRetryable(format!(
                    "grounding use-case capabilities cover only {:.0}% of the catalogue",
                    coverage * 100.0
                )));
            }
            let domain = pddl::emit_domain(hit, &plan);
            let problem = pddl::emit_problem(hit, &plan, &orchestration.id);
            let report = self.validator.validate(&domain, &problem).await?;
            if !report.valid {
                return Err(EngineError::RetryablePreparation(format!(
                    "PDDL validation rejected the plan: {}",
                    report.diagnostics.join("; ")
                )));
            }
        }

        let task_zero_input = plan
            .task_zero()
            .map(|t| t.input.clone())
            .unwrap_or_default();
        let mappings = discover_mappings(&task_zero_input, &orchestration.params);
        let task_zero = Value::Object(task_zero_input);

        let cache_entry = CacheEntry::new(
            serde_json::to_value(&plan)?,
            action_vector.to_vec(),
            catalogue_hash.to_string(),
            task_zero.clone(),
            mappings,
            orchestration.action_with_fields(),
            grounded,
        );

        Ok(PreparedPlan {
            plan,
            task_zero,
            cache_entry: Some(cache_entry),
        })
    }
}

/// Stamp a terminal preparation failure onto the orchestration.
fn fail_orchestration(orchestration: &mut Orchestration, err: &EngineError) {
    orchestration.status = match err {
        EngineError::NotActionable(_) => Status::NotActionable,
        _ => Status::Failed,
    };
    let message = match err {
        EngineError::NotActionable(inner) => inner.clone(),
        other => other.to_string(),
    };
    orchestration.error = Some(json!({ "error": message }));
    orchestration.timestamp = chrono::Utc::now();
}

/// Build the planner prompt from the action, params, catalogue, grounding,
/// and prior-attempt feedback.
fn build_planner_prompt(
    orchestration: &Orchestration,
    services: &HashMap<String, Service>,
    feedback: Option<&str>,
) -> String {
    let params_text = if orchestration.params.is_empty() {
        "None".to_string()
    } else {
        orchestration
            .params
            .iter()
            .map(|p| format!("- {}: {}", p.field, p.value))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut catalogue: Vec<&Service> = services.values().collect();
    catalogue.sort_by(|a, b| a.id.cmp(&b.id));
    let services_text = catalogue
        .iter()
        .map(|s| {
            format!(
                "- id: {}\n  name: {}\n  kind: {}\n  description: {}\n  input schema: {}\n  output schema: {}",
                s.id,
                s.name,
                s.kind.as_str(),
                s.description,
                serde_json::to_string(&s.schema.input).unwrap_or_default(),
                serde_json::to_string(&s.schema.output).unwrap_or_default(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let grounding_text = orchestration
        .grounding_hit
        .as_ref()
        .map(|hit| {
            format!(
                "## Domain grounding\nUse-case: {}\nIntent: {}\nConstraints: {}\n",
                hit.use_case.action,
                hit.use_case.intent,
                if hit.constraints.is_empty() {
                    "none".to_string()
                } else {
                    hit.constraints.join("; ")
                }
            )
        })
        .unwrap_or_default();

    let feedback_text = feedback
        .map(|f| format!("## Previous attempt feedback\n{f}\n"))
        .unwrap_or_default();

    format!(
        r#"You are a planning assistant that decomposes an action into a dependency-ordered execution plan over registered services.

## Action
{action}

## Action params
{params}

## Service catalogue
{services}

{grounding}{feedback}## Instructions
1. Produce a plan as JSON with a "tasks" array and a "parallelGroups" array.
2. Include a seed task with id "{task_zero}" whose input holds every literal value, including every action param as its own key.
3. Every other task must name a catalogue service id in "service" and take input values that reference producing tasks as "$<taskId>.<field>" (exactly one reference per value, no surrounding text).
4. Task inputs must match the service's input schema exactly.
5. "parallelGroups" lists task ids that may run concurrently, grouped by dependency level.
6. If the action cannot be satisfied by the catalogue, return a single task with id "final" and an "input" containing an "error" explaining why.

## Output format
Respond with only the plan JSON inside a ```json code fence.
"#,
        action = orchestration.action.content,
        params = params_text,
        services = services_text,
        grounding = grounding_text,
        feedback = feedback_text,
        task_zero = TASK_ZERO,
    )
}
