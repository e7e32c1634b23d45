//! Domain grounding model.
//!
//! A grounding spec declares the use-cases a project's domain supports. A
//! matched use-case gates plan preparation behind PDDL validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single grounded use-case pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingUseCase {
    /// Action pattern, may contain `{placeholder}` segments.
    pub action: String,
    /// Named parameters the pattern expects.
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, String>,
    /// Capabilities required to satisfy the use-case.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Declared intent, carried into the planner prompt.
    #[serde(default)]
    pub intent: String,
}

impl GroundingUseCase {
    /// Pattern with `{placeholder}` segments stripped, used for similarity
    /// matching against incoming actions.
    pub fn stripped_action(&self) -> String {
        let mut out = String::with_capacity(self.action.len());
        let mut in_placeholder = false;
        for ch in self.action.chars() {
            match ch {
                '{' => in_placeholder = true,
                '}' => in_placeholder = false,
                _ if !in_placeholder => out.push(ch),
                _ => {}
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// A project's grounding spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingSpec {
    pub project_id: String,
    pub name: String,
    pub domain: String,
    pub version: String,
    #[serde(default)]
    pub use_cases: Vec<GroundingUseCase>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A matched use-case, attached to an orchestration during preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingHit {
    /// Name of the grounding spec the use-case came from.
    pub name: String,
    pub domain: String,
    pub version: String,
    pub use_case: GroundingUseCase,
    /// Constraints inherited from the spec.
    #[serde(default)]
    pub constraints: Vec<String>,
}
