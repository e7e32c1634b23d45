//! PDDL emission for grounded orchestrations.
//!
//! When preparation matched a grounding use-case, the plan is rendered as a
//! PDDL domain/problem pair and handed to the external validator. Before
//! emitting, the use-case capabilities must fuzzy-match the service
//! catalogue.

use crate::domain::models::grounding::GroundingHit;
use crate::domain::models::plan::{ExecutionPlan, TASK_ZERO};
use crate::domain::models::Service;
use crate::domain::ports::embedding::{cosine_similarity, TrigramEmbeddingClient};

/// Minimum per-capability trigram cosine for a fuzzy match.
pub const CAPABILITY_MATCH_THRESHOLD: f32 = 0.75;
/// Fraction of use-case capabilities that must match before PDDL emission.
pub const CAPABILITY_COVERAGE_REQUIRED: f32 = 0.95;

/// PDDL parameter types inferred from field names.
const PARAM_TYPES: &[&str] = &[
    "id-value",
    "location-value",
    "timestamp-value",
    "quantity-value",
    "email-value",
    "text-value",
];

/// Infer a PDDL value type from a `task0` field name.
fn infer_param_type(field: &str) -> &'static str {
    let lower = field.to_lowercase();
    if lower == "id" || lower.ends_with("_id") || lower.ends_with("id") {
        "id-value"
    } else if ["address", "city", "location", "place", "destination"]
        .iter()
        .any(|w| lower.contains(w))
    {
        "location-value"
    } else if ["time", "date", "when", "deadline", "schedule"]
        .iter()
        .any(|w| lower.contains(w))
    {
        "timestamp-value"
    } else if ["count", "qty", "quantity", "number", "amount", "total"]
        .iter()
        .any(|w| lower.contains(w))
    {
        "quantity-value"
    } else if lower.contains("email") {
        "email-value"
    } else {
        "text-value"
    }
}

/// Lowercase a name into a PDDL-safe identifier.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}

fn task_zero_fields(plan: &ExecutionPlan) -> Vec<String> {
    plan.task_zero()
        .map(|t| t.input.keys().cloned().collect())
        .unwrap_or_default()
}

/// Fraction of use-case capabilities that fuzzy-match the concatenated
/// service capabilities.
pub fn capability_coverage(hit: &GroundingHit, services: &[Service]) -> f32 {
    let capabilities = &hit.use_case.capabilities;
    if capabilities.is_empty() {
        return 1.0;
    }
    let embedder = TrigramEmbeddingClient::default();
    let mut corpus: Vec<Vec<f32>> = services
        .iter()
        .map(|s| embedder.embed_sync(&s.description))
        .collect();
    let concatenated: String = services
        .iter()
        .map(|s| s.description.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    corpus.push(embedder.embed_sync(&concatenated));

    let matched = capabilities
        .iter()
        .filter(|capability| {
            let vector = embedder.embed_sync(capability);
            corpus
                .iter()
                .any(|c| cosine_similarity(c, &vector) >= CAPABILITY_MATCH_THRESHOLD)
        })
        .count();
    matched as f32 / capabilities.len() as f32
}

/// Emit the PDDL domain: one `execute-service` action parameterised by the
/// service plus each `task0` field, typed by name inference.
pub fn emit_domain(hit: &GroundingHit, plan: &ExecutionPlan) -> String {
    let domain_name = sanitize(&hit.domain);
    let fields = task_zero_fields(plan);

    let mut out = String::new();
    out.push_str(&format!("(define (domain {domain_name})\n"));
    out.push_str("  (:requirements :strips :typing)\n");
    out.push_str("  (:types\n    service - object\n");
    out.push_str(&format!(
        "    {} - object)\n",
        PARAM_TYPES.join(" ")
    ));
    out.push_str("  (:predicates\n");
    out.push_str("    (service-task ?s - service)\n");
    for field in &fields {
        out.push_str(&format!(
            "    (param-valid-{} ?v - {})\n",
            sanitize(field),
            infer_param_type(field)
        ));
    }
    out.push_str("    (depends-on ?a - service ?b - service)\n");
    out.push_str("    (executed ?s - service))\n");

    out.push_str("  (:action execute-service\n");
    out.push_str("    :parameters (?svc - service");
    for field in &fields {
        out.push_str(&format!(" ?{} - {}", sanitize(field), infer_param_type(field)));
    }
    out.push_str(")\n");
    out.push_str("    :precondition (and (service-task ?svc)");
    for field in &fields {
        out.push_str(&format!(" (param-valid-{0} ?{0})", sanitize(field)));
    }
    out.push_str(")\n");
    out.push_str("    :effect (executed ?svc)))\n");
    out
}

/// Emit the PDDL problem: service task objects, parameter objects with
/// validity predicates, and `depends-on` edges harvested from each task's
/// reference graph (`task0` dependencies excluded).
pub fn emit_problem(hit: &GroundingHit, plan: &ExecutionPlan, orchestration_id: &str) -> String {
    let domain_name = sanitize(&hit.domain);
    let problem_name = sanitize(orchestration_id);
    let fields = task_zero_fields(plan);

    let tasks: Vec<String> = plan
        .executable_tasks()
        .map(|t| sanitize(&t.id))
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        "(define (problem {problem_name})\n  (:domain {domain_name})\n"
    ));

    out.push_str("  (:objects\n");
    if !tasks.is_empty() {
        out.push_str(&format!("    {} - service\n", tasks.join(" ")));
    }
    for field in &fields {
        out.push_str(&format!(
            "    {}-param - {}\n",
            sanitize(field),
            infer_param_type(field)
        ));
    }
    out.push_str("  )\n");

    out.push_str("  (:init\n");
    for task in &tasks {
        out.push_str(&format!("    (service-task {task})\n"));
    }
    for field in &fields {
        out.push_str(&format!(
            "    (param-valid-{0} {0}-param)\n",
            sanitize(field)
        ));
    }
    for task in plan.executable_tasks() {
        for dep in task.dependency_ids() {
            if dep == TASK_ZERO {
                continue;
            }
            out.push_str(&format!(
                "    (depends-on {} {})\n",
                sanitize(&task.id),
                sanitize(&dep)
            ));
        }
    }
    out.push_str("  )\n");

    out.push_str("  (:goal (and\n");
    for task in &tasks {
        out.push_str(&format!("    (executed {task})\n"));
    }
    out.push_str("  ))\n)\n");
    out
}
