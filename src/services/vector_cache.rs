//! Vector-similarity plan cache.
//!
//! Validated plans are cached per project, keyed by the embedding of
//! `action::field1::field2...`. A probe returns a cached plan only when the
//! service catalogue hash matches, the grounding mode matches, similarity
//! clears the threshold, and the stored parameter mappings cover every
//! current action-param field. Hits are rewritten with today's parameter
//! values before being returned.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::plan::TASK_ZERO;
use crate::domain::models::{ActionParam, CacheEntry, CacheMapping};
use crate::domain::ports::embedding::cosine_similarity;

/// Similarity required for a usable hit.
pub const HIT_THRESHOLD: f32 = 0.95;
/// Similarity treated as an exact match; the scan short-circuits.
pub const EXACT_THRESHOLD: f32 = 0.999;
/// Default per-entry time-to-live.
pub const DEFAULT_TTL_HOURS: i64 = 24;
/// Default per-project entry cap; oldest entries are evicted first.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// A cache probe result, already rewritten with the probe's parameters.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry_id: String,
    pub plan: Value,
    pub task_zero: Value,
    pub similarity: f32,
}

#[derive(Default)]
struct ProjectCache {
    entries: VecDeque<CacheEntry>,
}

/// Per-project plan cache over action embeddings.
pub struct VectorCache {
    projects: RwLock<HashMap<String, Arc<Mutex<ProjectCache>>>>,
    ttl: Duration,
    max_size: usize,
}

impl Default for VectorCache {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_TTL_HOURS), DEFAULT_MAX_SIZE)
    }
}

impl VectorCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            ttl,
            max_size,
        }
    }

    async fn project_cache(&self, project_id: &str) -> Arc<Mutex<ProjectCache>> {
        if let Some(cache) = self.projects.read().await.get(project_id) {
            return Arc::clone(cache);
        }
        let mut projects = self.projects.write().await;
        Arc::clone(
            projects
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProjectCache::default()))),
        )
    }

    /// Probe the project cache with a precomputed action vector.
    ///
    /// Expired entries are evicted on touch. Only entries whose services
    /// hash and grounding mode match are scored; a hit additionally needs
    /// its stored mappings to cover every action-param field.
    pub async fn probe(
        &self,
        project_id: &str,
        action_vector: &[f32],
        params: &[ActionParam],
        services_hash: &str,
        grounded: bool,
    ) -> EngineResult<Option<CacheHit>> {
        let cache = self.project_cache(project_id).await;
        let mut cache = cache.lock().await;

        let now = Utc::now();
        let ttl = self.ttl;
        cache.entries.retain(|entry| now - entry.timestamp <= ttl);

        let mut best: Option<(f32, CacheEntry)> = None;
        for entry in &cache.entries {
            if entry.services_hash != services_hash || entry.grounded != grounded {
                continue;
            }
            let score = cosine_similarity(&entry.action_vector, action_vector);
            if score <= HIT_THRESHOLD {
                continue;
            }
            if !entry.covers_fields(params.iter().map(|p| p.field.as_str())) {
                continue;
            }
            if score > EXACT_THRESHOLD {
                best = Some((score, entry.clone()));
                break;
            }
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, entry.clone()));
            }
        }
        drop(cache);

        let Some((similarity, entry)) = best else {
            return Ok(None);
        };
        debug!(
            project_id,
            entry_id = %entry.id,
            similarity = f64::from(similarity),
            "vector cache hit"
        );
        let hit = substitute_params(&entry, params)?;
        Ok(Some(CacheHit {
            entry_id: entry.id,
            plan: hit.0,
            task_zero: hit.1,
            similarity,
        }))
    }

    /// Insert a freshly validated plan; oldest entries are evicted once the
    /// project cap is reached.
    pub async fn insert(&self, project_id: &str, entry: CacheEntry) {
        let cache = self.project_cache(project_id).await;
        let mut cache = cache.lock().await;
        while cache.entries.len() >= self.max_size {
            cache.entries.pop_front();
        }
        cache.entries.push_back(entry);
    }

    /// Drop an entry, typically after a terminal preparation failure traced
    /// back to it.
    pub async fn evict(&self, project_id: &str, entry_id: &str) {
        let cache = self.project_cache(project_id).await;
        let mut cache = cache.lock().await;
        cache.entries.retain(|entry| entry.id != entry_id);
    }

    pub async fn entry_count(&self, project_id: &str) -> usize {
        let cache = self.project_cache(project_id).await;
        let cache = cache.lock().await;
        cache.entries.len()
    }
}

/// Rewrite a cached plan's `task0` input using the probe's action params.
///
/// Every mapped field takes the value of its action-param field; a mapping
/// whose action field is absent from the params is a hard error.
fn substitute_params(entry: &CacheEntry, params: &[ActionParam]) -> EngineResult<(Value, Value)> {
    let by_field: HashMap<&str, &Value> =
        params.iter().map(|p| (p.field.as_str(), &p.value)).collect();

    let mut substitutions: HashMap<&str, Value> = HashMap::new();
    for mapping in &entry.cache_mappings {
        let value = by_field.get(mapping.action_field.as_str()).ok_or_else(|| {
            EngineError::FailedNotRetryable(format!(
                "cached plan requires action param '{}' which is missing",
                mapping.action_field
            ))
        })?;
        substitutions.insert(mapping.field.as_str(), (*value).clone());
    }

    let mut plan = entry.response.clone();
    if let Some(tasks) = plan.get_mut("tasks").and_then(Value::as_array_mut) {
        for task in tasks.iter_mut() {
            if task.get("id").and_then(Value::as_str) == Some(TASK_ZERO) {
                if let Some(input) = task.get_mut("input").and_then(Value::as_object_mut) {
                    for (field, value) in &substitutions {
                        input.insert((*field).to_string(), value.clone());
                    }
                }
            }
        }
    }

    let mut task_zero = entry.task_zero_input.clone();
    if let Some(object) = task_zero.as_object_mut() {
        for (field, value) in &substitutions {
            object.insert((*field).to_string(), value.clone());
        }
    }

    Ok((plan, task_zero))
}

/// Canonical JSON rendering with recursively sorted object keys; used to
/// compare complex values structurally.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), v))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

fn primitive_form(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".into()),
        _ => None,
    }
}

/// Discover which `task0` input fields are fed by which action params.
///
/// Primitives compare by string form, complex values by canonical JSON.
pub fn discover_mappings(
    task_zero_input: &serde_json::Map<String, Value>,
    params: &[ActionParam],
) -> Vec<CacheMapping> {
    let mut mappings = Vec::new();
    for (field, value) in task_zero_input {
        let matched = params.iter().find(|param| {
            match (primitive_form(value), primitive_form(&param.value)) {
                (Some(a), Some(b)) => a == b,
                (None, None) => canonical_json(value) == canonical_json(&param.value),
                _ => false,
            }
        });
        if let Some(param) = matched {
            mappings.push(CacheMapping {
                field: field.clone(),
                action_field: param.field.clone(),
                value: value.clone(),
            });
        }
    }
    mappings
}
