//! Service domain model.
//!
//! Services (and agents) are the remote executors tasks are routed to. Each
//! carries a typed input/output schema and a revertibility flag controlling
//! whether compensations are collected for it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Discriminates plain services from agents. Both are dispatched the same
/// way; the kind is descriptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Service,
    Agent,
}

impl Default for ServiceKind {
    fn default() -> Self {
        Self::Service
    }
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Agent => "agent",
        }
    }
}

/// Recursive typed-object descriptor for service inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// One of `object`, `string`, `number`, `integer`, `boolean`, `array`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Schema {
    pub fn object(properties: BTreeMap<String, Schema>) -> Self {
        Self {
            kind: "object".into(),
            properties,
            items: None,
            required: Vec::new(),
        }
    }

    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }
}

/// Combined input/output schema of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchema {
    #[serde(default)]
    pub input: Schema,
    #[serde(default)]
    pub output: Schema,
}

/// A registered remote service or agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ServiceKind,
    pub description: String,
    pub schema: ServiceSchema,
    /// Whether the service emits a compensation payload with its result.
    #[serde(default)]
    pub revertible: bool,
    pub version: i64,
    pub registered_at: DateTime<Utc>,
}

impl Service {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        kind: ServiceKind,
        description: impl Into<String>,
        schema: ServiceSchema,
        revertible: bool,
    ) -> Self {
        Self {
            id: format!("s_{}", Uuid::new_v4().simple()),
            project_id: project_id.into(),
            name: name.into(),
            kind,
            description: description.into(),
            schema,
            revertible,
            version: 1,
            registered_at: Utc::now(),
        }
    }

    /// Re-registration keeps the id and bumps the version, replacing the
    /// mutable fields.
    pub fn apply_update(&mut self, incoming: Service) {
        self.kind = incoming.kind;
        self.description = incoming.description;
        self.schema = incoming.schema;
        self.revertible = incoming.revertible;
        self.version += 1;
        self.registered_at = Utc::now();
    }

    /// One-line catalogue entry used in planner prompts and the services
    /// hash.
    pub fn catalogue_line(&self) -> String {
        format!(
            "{}::{}::{}::{}",
            self.id,
            self.name,
            self.kind.as_str(),
            self.description
        )
    }
}

/// SHA-256 over the concatenated catalogue description, stable across
/// iteration order.
pub fn services_hash(services: &[Service]) -> String {
    let mut lines: Vec<String> = services.iter().map(Service::catalogue_line).collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_service(name: &str) -> Service {
        let mut props = BTreeMap::new();
        props.insert("message".into(), Schema::of_kind("string"));
        Service::new(
            "p1",
            name,
            ServiceKind::Service,
            "Echoes a message back",
            ServiceSchema {
                input: Schema::object(props.clone()),
                output: Schema::object(props),
            },
            false,
        )
    }

    #[test]
    fn test_apply_update_bumps_version() {
        let mut service = sample_service("echo");
        let id = service.id.clone();
        let mut incoming = sample_service("echo");
        incoming.description = "Echoes, now louder".into();
        service.apply_update(incoming);
        assert_eq!(service.id, id);
        assert_eq!(service.version, 2);
        assert_eq!(service.description, "Echoes, now louder");
    }

    #[test]
    fn test_services_hash_order_independent() {
        let a = sample_service("alpha");
        let b = sample_service("beta");
        let h1 = services_hash(&[a.clone(), b.clone()]);
        let h2 = services_hash(&[b, a]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_services_hash_changes_with_catalogue() {
        let a = sample_service("alpha");
        let mut b = sample_service("alpha");
        b.description = "Different".into();
        assert_ne!(services_hash(&[a.clone()]), services_hash(&[b]));
        assert_ne!(services_hash(&[a]), services_hash(&[]));
    }

    #[test]
    fn test_schema_roundtrip() {
        let service = sample_service("echo");
        let json = serde_json::to_string(&service).unwrap();
        let back: Service = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema, service.schema);
    }
}
