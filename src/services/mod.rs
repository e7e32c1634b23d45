//! Application services for the Orra plan engine.

pub mod backoff;
pub mod compensation;
pub mod engine;
pub mod idempotency;
pub mod incident_tracker;
pub mod log;
pub mod pddl;
pub mod plan_validation;
pub mod preparation;
pub mod result_aggregator;
pub mod single_flight;
pub mod task_worker;
pub mod vector_cache;
pub mod webhooks;

pub use compensation::{CompensationWorker, COMPENSATION_PRODUCER};
pub use engine::{OrchestrationFinalizer, PlanEngine};
pub use idempotency::{ExecutionRecord, ExecutionState, IdempotencyStore, PauseReason};
pub use incident_tracker::IncidentTracker;
pub use log::{Log, LogManager};
pub use preparation::{PlanPreparer, GROUNDING_MATCH_THRESHOLD, MAX_PREPARATION_ATTEMPTS};
pub use result_aggregator::ResultAggregator;
pub use single_flight::SingleFlight;
pub use task_worker::{TaskWorker, TaskWorkerContext};
pub use vector_cache::{CacheHit, VectorCache};
pub use webhooks::{CompletionEvent, WebhookNotifier};

/// Drop a leading `<think>...</think>` block some reasoning models prepend.
pub fn strip_think_block(response: &str) -> &str {
    let trimmed = response.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim_start();
        }
    }
    trimmed
}

/// Extract the JSON payload from a generator response, handling markdown
/// code fences and surrounding prose.
pub fn extract_json_from_response(response: &str) -> String {
    let trimmed = response.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
    }

    // Handle ``` ... ``` blocks
    if trimmed.starts_with("```") {
        if let Some(end) = trimmed.rfind("```") {
            let start = if trimmed.starts_with("```\n") { 4 } else { 3 };
            if end > start {
                return trimmed[start..end].trim().to_string();
            }
        }
    }

    // If it already looks like a JSON object, use it directly
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed.to_string();
    }

    // Try to find a JSON object embedded in text
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return trimmed[start..=end].to_string();
            }
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_block() {
        let response = "<think>planning...</think>\n```json\n{}\n```";
        assert_eq!(strip_think_block(response), "```json\n{}\n```");
        assert_eq!(strip_think_block("plain"), "plain");
        assert_eq!(strip_think_block("<think>unclosed"), "<think>unclosed");
    }

    #[test]
    fn test_extract_json_plain() {
        assert_eq!(extract_json_from_response(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_fenced() {
        let response = "Here is the plan:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_from_response(response), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_bare_fence() {
        let response = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_from_response(response), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let response = "The plan is {\"a\": 1} as requested.";
        assert_eq!(extract_json_from_response(response), r#"{"a": 1}"#);
    }
}
