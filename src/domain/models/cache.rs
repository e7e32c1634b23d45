//! Vector cache entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Links a `task0` input field to the action-param field whose value fills
/// it on a cache hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMapping {
    /// `task0` input field.
    pub field: String,
    /// Action-param field providing the value.
    pub action_field: String,
    /// Value observed when the entry was cached.
    pub value: Value,
}

/// A cached, validated plan keyed by action embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    /// The enriched plan JSON as committed at preparation time.
    pub response: Value,
    /// Unit-normalized embedding of `action::field1::field2...`.
    pub action_vector: Vec<f32>,
    /// SHA-256 of the service catalogue at caching time.
    pub services_hash: String,
    /// `task0` input at caching time.
    pub task_zero_input: Value,
    pub cache_mappings: Vec<CacheMapping>,
    pub timestamp: DateTime<Utc>,
    pub cached_action_with_fields: String,
    /// Whether the cached plan was prepared under a grounding hit.
    #[serde(default)]
    pub grounded: bool,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        response: Value,
        action_vector: Vec<f32>,
        services_hash: String,
        task_zero_input: Value,
        cache_mappings: Vec<CacheMapping>,
        cached_action_with_fields: String,
        grounded: bool,
    ) -> Self {
        Self {
            id: format!("c_{}", Uuid::new_v4().simple()),
            response,
            action_vector,
            services_hash,
            task_zero_input,
            cache_mappings,
            timestamp: Utc::now(),
            cached_action_with_fields,
            grounded,
        }
    }

    /// Whether the stored mappings can satisfy every given action-param
    /// field.
    pub fn covers_fields<'a>(&self, fields: impl Iterator<Item = &'a str>) -> bool {
        fields
            .into_iter()
            .all(|f| self.cache_mappings.iter().any(|m| m.action_field == f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_covers_fields() {
        let entry = CacheEntry::new(
            json!({}),
            vec![1.0],
            "hash".into(),
            json!({}),
            vec![CacheMapping {
                field: "message".into(),
                action_field: "message".into(),
                value: json!("Hello"),
            }],
            "echo::message".into(),
            false,
        );
        assert!(entry.covers_fields(["message"].into_iter()));
        assert!(!entry.covers_fields(["message", "tone"].into_iter()));
        assert!(entry.covers_fields(std::iter::empty()));
    }
}
