//! Reasoning port for plan generation.

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};

/// Port interface for the generative model that produces candidate plans.
///
/// The engine never plans itself; it prompts the model and validates the
/// result.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Provider name for diagnostics (e.g. "openai", "groq").
    fn name(&self) -> &'static str;

    /// Generate a completion for `prompt` and return the raw text.
    async fn generate(&self, prompt: &str) -> EngineResult<String>;
}

/// A reasoning client that replays canned responses; test double.
#[derive(Debug, Default)]
pub struct ScriptedReasoningClient {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedReasoningClient {
    pub fn new(responses: impl IntoIterator<Item = String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn push(&self, response: String) {
        self.responses.lock().expect("lock poisoned").push_back(response);
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, _prompt: &str) -> EngineResult<String> {
        self.responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| EngineError::Reasoning("no scripted response left".into()))
    }
}
