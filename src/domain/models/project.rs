//! Project domain model.
//!
//! A project owns services, orchestrations, groundings, credentials, and
//! webhook endpoints. Projects are created on registration and never
//! destroyed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Opaque project identifier.
    pub id: String,
    /// Primary API credential.
    pub api_key: String,
    /// Additional credentials minted after registration.
    #[serde(default)]
    pub additional_api_keys: Vec<String>,
    /// Completion webhook URLs, notified on every terminal orchestration.
    #[serde(default)]
    pub webhooks: Vec<String>,
    /// Webhook URLs notified when a compensation fails or expires.
    #[serde(default)]
    pub compensation_failure_webhooks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            id: format!("p_{}", Uuid::new_v4().simple()),
            api_key: generate_api_key(),
            additional_api_keys: Vec::new(),
            webhooks: webhook.into_iter().collect(),
            compensation_failure_webhooks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// All credentials that resolve to this project.
    pub fn all_api_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.api_key.as_str())
            .chain(self.additional_api_keys.iter().map(String::as_str))
    }

    pub fn accepts_key(&self, key: &str) -> bool {
        self.all_api_keys().any(|k| k == key)
    }

    /// Mint an additional API key and return it.
    pub fn add_api_key(&mut self) -> String {
        let key = generate_api_key();
        self.additional_api_keys.push(key.clone());
        key
    }

    pub fn add_webhook(&mut self, url: String) {
        if !self.webhooks.contains(&url) {
            self.webhooks.push(url);
        }
    }

    pub fn add_compensation_failure_webhook(&mut self, url: String) {
        if !self.compensation_failure_webhooks.contains(&url) {
            self.compensation_failure_webhooks.push(url);
        }
    }
}

fn generate_api_key() -> String {
    format!("sk-orra-{}", Uuid::new_v4().simple())
}
