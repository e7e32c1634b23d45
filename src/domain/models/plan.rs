//! Execution plan model.
//!
//! A plan is a set of subtasks plus informational parallel groups. The
//! distinguished `task0` holds the action's literal inputs; every other
//! task's inputs reference a producing task's output via `$<taskId>.<field>`.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::service::Schema;

/// Id of the synthetic seed task.
pub const TASK_ZERO: &str = "task0";

/// Id the generator uses to declare an action non-actionable.
pub const FINAL_TASK: &str = "final";

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$([^.\s$]+)\.([A-Za-z0-9_.\-]+)").expect("valid regex"))
}

fn exact_reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$([^.\s$]+)\.([A-Za-z0-9_.\-]+)$").expect("valid regex"))
}

/// Parse a string that is exactly one `$<taskId>.<field>` reference.
pub fn parse_exact_reference(value: &str) -> Option<(String, String)> {
    exact_reference_regex()
        .captures(value.trim())
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

/// Extract every `$<taskId>.<field>` occurrence inside a string, exact or
/// embedded.
pub fn extract_references(value: &str) -> Vec<(String, String)> {
    reference_regex()
        .captures_iter(value)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// A single task of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    /// Owning service id; empty for task0.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default)]
    pub input: serde_json::Map<String, Value>,
    /// Enriched from the service catalogue after validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_input: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Schema>,
}

impl SubTask {
    pub fn new(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            input: serde_json::Map::new(),
            service_name: None,
            capabilities: Vec::new(),
            expected_input: None,
            expected_output: None,
        }
    }

    pub fn is_task_zero(&self) -> bool {
        self.id == TASK_ZERO
    }

    /// Ids of tasks this task's inputs reference.
    pub fn dependency_ids(&self) -> HashSet<String> {
        let mut deps = HashSet::new();
        for value in self.input.values() {
            if let Value::String(s) = value {
                for (task_id, _) in extract_references(s) {
                    deps.insert(task_id);
                }
            }
        }
        deps
    }

    /// Input keys resolved from dependencies: `task input key ← (producer,
    /// producer output field)`.
    pub fn dependency_mappings(&self) -> Vec<(String, String, String)> {
        let mut mappings = Vec::new();
        for (key, value) in &self.input {
            if let Value::String(s) = value {
                if let Some((task_id, field)) = parse_exact_reference(s) {
                    mappings.push((key.clone(), task_id, field));
                }
            }
        }
        mappings
    }
}

/// A dependency-ordered execution plan over registered services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub tasks: Vec<SubTask>,
    #[serde(
        rename = "parallelGroups",
        alias = "parallel_groups",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub parallel_groups: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn task_zero(&self) -> Option<&SubTask> {
        self.tasks.iter().find(|t| t.is_task_zero())
    }

    pub fn task_zero_mut(&mut self) -> Option<&mut SubTask> {
        self.tasks.iter_mut().find(|t| t.is_task_zero())
    }

    pub fn get_task(&self, id: &str) -> Option<&SubTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn executable_tasks(&self) -> impl Iterator<Item = &SubTask> {
        self.tasks.iter().filter(|t| !t.is_task_zero())
    }

    /// The task the generator emits to declare an action impossible, if any.
    pub fn final_task_error(&self) -> Option<String> {
        self.get_task(FINAL_TASK).and_then(|t| {
            t.input
                .get("error")
                .map(|v| v.as_str().map_or_else(|| v.to_string(), String::from))
        })
    }

    /// Structural validation: exactly one task0, known reference targets,
    /// parallel groups partition the executable tasks, and the reference
    /// graph rooted at task0 is acyclic.
    pub fn validate_structure(&self) -> Result<(), String> {
        let zero_count = self.tasks.iter().filter(|t| t.is_task_zero()).count();
        if zero_count != 1 {
            return Err(format!("plan must contain exactly one task0, found {zero_count}"));
        }

        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        if ids.len() != self.tasks.len() {
            return Err("plan contains duplicate task ids".into());
        }

        for task in &self.tasks {
            for dep in task.dependency_ids() {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "task {} references unknown task {dep}",
                        task.id
                    ));
                }
            }
        }

        if !self.parallel_groups.is_empty() {
            let mut seen = HashSet::new();
            for group in &self.parallel_groups {
                for id in group {
                    if id == TASK_ZERO {
                        return Err("parallel groups may not contain task0".into());
                    }
                    if !ids.contains(id.as_str()) {
                        return Err(format!("parallel group references unknown task {id}"));
                    }
                    if !seen.insert(id.as_str()) {
                        return Err(format!("task {id} appears in multiple parallel groups"));
                    }
                }
            }
            let executable: HashSet<&str> =
                self.executable_tasks().map(|t| t.id.as_str()).collect();
            if seen != executable {
                return Err("parallel groups do not partition the executable tasks".into());
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.tasks.len()];

        fn visit(
            plan: &ExecutionPlan,
            index: &HashMap<&str, usize>,
            marks: &mut [Mark],
            at: usize,
        ) -> Result<(), String> {
            match marks[at] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(format!("dependency cycle through task {}", plan.tasks[at].id))
                }
                Mark::Unvisited => {}
            }
            marks[at] = Mark::InProgress;
            for dep in plan.tasks[at].dependency_ids() {
                if let Some(&next) = index.get(dep.as_str()) {
                    visit(plan, index, marks, next)?;
                }
            }
            marks[at] = Mark::Done;
            Ok(())
        }

        for i in 0..self.tasks.len() {
            visit(self, &index, &mut marks, i)?;
        }
        Ok(())
    }
}
