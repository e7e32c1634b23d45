//! Plan validator port (external PDDL checker).

use async_trait::async_trait;

use crate::domain::errors::EngineResult;

/// Result of validating an emitted PDDL domain/problem pair.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    /// Validator diagnostics when invalid.
    pub diagnostics: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn invalid(diagnostics: Vec<String>) -> Self {
        Self {
            valid: false,
            diagnostics,
        }
    }
}

/// Port interface for the external PDDL validator.
#[async_trait]
pub trait PlanValidator: Send + Sync {
    async fn validate(&self, domain: &str, problem: &str) -> EngineResult<ValidationReport>;
}

/// Validator that accepts everything; used when no validator binary is
/// configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl PlanValidator for AcceptAllValidator {
    async fn validate(&self, _domain: &str, _problem: &str) -> EngineResult<ValidationReport> {
        Ok(ValidationReport::valid())
    }
}
