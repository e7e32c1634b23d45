//! Generated-plan validation and normalization.
//!
//! After the generator returns a candidate plan, literals are hoisted into
//! `task0`, action params are checked for presence, composite `task0`
//! references are rejected, and each subtask's inputs are validated against
//! its service schema. Validation failures produce feedback the retry loop
//! hands back to the generator, progressively more detailed per attempt.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::domain::models::plan::{
    extract_references, parse_exact_reference, ExecutionPlan, TASK_ZERO,
};
use crate::domain::models::{ActionParam, Service};

/// Hoist literal inputs of every executable task into `task0`.
///
/// A literal reusing an existing `task0` key with the same value is
/// deduplicated; a key collision with a different value gets a suffixed key
/// (`key_2`, `key_3`, ...). The task input is rewritten to `$task0.<key>`.
pub fn lift_literals_into_task_zero(plan: &mut ExecutionPlan) {
    let mut task_zero_input = match plan.task_zero() {
        Some(task) => task.input.clone(),
        None => return,
    };

    let mut order: Vec<usize> = (0..plan.tasks.len())
        .filter(|&i| !plan.tasks[i].is_task_zero())
        .collect();
    order.sort_by(|&a, &b| plan.tasks[a].id.cmp(&plan.tasks[b].id));

    for index in order {
        let task = &mut plan.tasks[index];
        let keys: Vec<String> = task.input.keys().cloned().collect();
        for key in keys {
            let value = task.input.get(&key).cloned().unwrap_or(Value::Null);
            if let Value::String(s) = &value {
                if !extract_references(s).is_empty() {
                    continue;
                }
            }
            let slot = hoist_slot(&mut task_zero_input, &key, &value);
            task.input
                .insert(key, Value::String(format!("${TASK_ZERO}.{slot}")));
        }
    }

    if let Some(task_zero) = plan.task_zero_mut() {
        task_zero.input = task_zero_input;
    }
}

/// Find or create the `task0` key holding `value`, suffixing on collision.
fn hoist_slot(
    task_zero_input: &mut serde_json::Map<String, Value>,
    key: &str,
    value: &Value,
) -> String {
    match task_zero_input.get(key) {
        None => {
            task_zero_input.insert(key.to_string(), value.clone());
            return key.to_string();
        }
        Some(existing) if existing == value => return key.to_string(),
        Some(_) => {}
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{key}_{counter}");
        match task_zero_input.get(&candidate) {
            None => {
                task_zero_input.insert(candidate.clone(), value.clone());
                return candidate;
            }
            Some(existing) if existing == value => return candidate,
            Some(_) => counter += 1,
        }
    }
}

/// Verify every action-param field appears as a top-level `task0` key.
///
/// The returned feedback elaborates with each attempt: first a plain list,
/// then an embedded-vs-missing diagnosis, then remediation naming the
/// services that consume each field.
pub fn check_param_presence(
    plan: &ExecutionPlan,
    params: &[ActionParam],
    attempt: u32,
    services: &HashMap<String, Service>,
) -> Result<(), String> {
    let Some(task_zero) = plan.task_zero() else {
        return Err("plan has no task0 to hold action params".into());
    };

    let missing: Vec<&str> = params
        .iter()
        .map(|p| p.field.as_str())
        .filter(|field| !task_zero.input.contains_key(*field))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let listed = missing.join(", ");
    let feedback = match attempt {
        0 => format!("The plan's task0 is missing required action params: {listed}."),
        1 => {
            let mut lines = vec![format!(
                "The plan's task0 is missing required action params: {listed}."
            )];
            for field in &missing {
                if let Some(holder) = find_embedded_param(task_zero, field) {
                    lines.push(format!(
                        "Param '{field}' appears embedded inside the value of task0 key \
                         '{holder}'; it must be its own top-level task0 key instead."
                    ));
                } else {
                    lines.push(format!(
                        "Param '{field}' does not appear anywhere in task0; add it as a \
                         top-level key."
                    ));
                }
            }
            lines.join(" ")
        }
        _ => {
            let mut lines = vec![format!(
                "The plan's task0 is still missing required action params: {listed}."
            )];
            for field in &missing {
                let consumers: Vec<&str> = services
                    .values()
                    .filter(|s| s.schema.input.properties.contains_key(*field))
                    .map(|s| s.name.as_str())
                    .collect();
                if consumers.is_empty() {
                    lines.push(format!(
                        "Add '{field}' as a top-level task0 key and reference it as \
                         $task0.{field} from the task that needs it."
                    ));
                } else {
                    lines.push(format!(
                        "Add '{field}' as a top-level task0 key and pass it as \
                         $task0.{field} into the input of: {}.",
                        consumers.join(", ")
                    ));
                }
            }
            lines.join(" ")
        }
    };
    Err(feedback)
}

/// Detect an action-param name embedded inside another `task0` string value
/// (`param: v`, `param=v`, `param is v`).
fn find_embedded_param<'a>(
    task_zero: &'a crate::domain::models::SubTask,
    field: &str,
) -> Option<&'a str> {
    let escaped = regex::escape(field);
    let pattern =
        Regex::new(&format!(r"(?i)\b{escaped}\s*(?:[:=]|is\b)\s*\S+")).ok()?;
    task_zero.input.iter().find_map(|(key, value)| {
        let Value::String(s) = value else { return None };
        pattern.is_match(s).then_some(key.as_str())
    })
}

/// Reject `task0` references mixed with literal text or stacked in one
/// value: every string referencing `task0` must be exactly one
/// `$task0.<field>`.
pub fn reject_composite_task_zero_refs(plan: &ExecutionPlan, attempt: u32) -> Result<(), String> {
    let mut offending = Vec::new();
    for task in plan.executable_tasks() {
        for (key, value) in &task.input {
            let Value::String(s) = value else { continue };
            let task_zero_refs = extract_references(s)
                .into_iter()
                .filter(|(task_id, _)| task_id == TASK_ZERO)
                .count();
            if task_zero_refs == 0 {
                continue;
            }
            let exact = parse_exact_reference(s)
                .is_some_and(|(task_id, _)| task_id == TASK_ZERO);
            if !exact || task_zero_refs > 1 {
                offending.push(format!("{}.{key} = {s:?}", task.id));
            }
        }
    }
    if offending.is_empty() {
        return Ok(());
    }

    let listed = offending.join(", ");
    Err(match attempt {
        0 => format!("These task inputs mix task0 references with other content: {listed}."),
        1 => format!(
            "These task inputs mix task0 references with other content: {listed}. A task \
             input may either be a literal or exactly one $task0.<field> reference; \
             interpolating a reference into surrounding text is not resolvable."
        ),
        _ => format!(
            "These task inputs still mix task0 references with other content: {listed}. \
             Split each composite value: put the literal part into task0 as its own key \
             and pass each piece as a separate input, e.g. {{\"city\": \"$task0.city\"}} \
             instead of {{\"city\": \"City: $task0.city\"}}."
        ),
    })
}

/// Validate each executable task against its service schema: the service
/// must exist, every input key must be declared, and every declared
/// top-level property must be present.
pub fn validate_subtask_io(
    plan: &ExecutionPlan,
    services: &HashMap<String, Service>,
) -> Result<(), String> {
    let mut errors = Vec::new();
    for task in plan.executable_tasks() {
        let Some(service) = services.get(&task.service) else {
            errors.push(format!(
                "task {} references unknown service {}",
                task.id, task.service
            ));
            continue;
        };
        let declared = &service.schema.input.properties;
        for key in task.input.keys() {
            if !declared.contains_key(key) {
                errors.push(format!(
                    "task {} input '{key}' is not declared by service {}",
                    task.id, service.name
                ));
            }
        }
        for key in declared.keys() {
            if !task.input.contains_key(key) {
                errors.push(format!(
                    "task {} is missing input '{key}' declared by service {}",
                    task.id, service.name
                ));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Populate service name, capabilities, and expected schemas on each
/// executable task from the catalogue.
pub fn enrich_plan(plan: &mut ExecutionPlan, services: &HashMap<String, Service>) {
    for task in plan.tasks.iter_mut() {
        if task.is_task_zero() {
            continue;
        }
        if let Some(service) = services.get(&task.service) {
            task.service_name = Some(service.name.clone());
            task.capabilities = vec![service.description.clone()];
            task.expected_input = Some(service.schema.input.clone());
            task.expected_output = Some(service.schema.output.clone());
        }
    }
}
