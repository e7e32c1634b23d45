//! Webhook delivery.
//!
//! Completion and compensation-failure webhooks are best-effort one-shot
//! POSTs: non-2xx responses are logged and dropped, never retried.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{FailedCompensation, Status};

const EVENT_HEADER: &str = "X-Orra-Event";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of an orchestration completion webhook.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: String,
    pub orchestration_id: String,
    pub status: String,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<Value>,
}

impl CompletionEvent {
    pub fn new(
        project_id: impl Into<String>,
        orchestration_id: impl Into<String>,
        status: Status,
        results: Option<Vec<Value>>,
        error: Option<Value>,
        abort_reason: Option<Value>,
    ) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            kind: format!("orchestration.{}", status.as_str()),
            project_id: project_id.into(),
            orchestration_id: orchestration_id.into(),
            status: status.as_str().to_string(),
            timestamp: Utc::now(),
            results,
            error,
            abort_reason,
        }
    }
}

/// Posts webhook events for the engine.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// POST a completion event to every completion webhook.
    pub async fn notify_completion(&self, urls: &[String], event: &CompletionEvent) {
        for url in urls {
            self.post(url, &event.kind, event).await;
        }
    }

    /// POST a failed-compensation record to every compensation-failure
    /// webhook.
    pub async fn notify_compensation_failure(
        &self,
        urls: &[String],
        record: &FailedCompensation,
    ) {
        for url in urls {
            self.post(url, "compensation.failed", record).await;
        }
    }

    async fn post<T: Serialize>(&self, url: &str, event_kind: &str, body: &T) {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event_kind)
            .json(body)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                debug!(%url, event = event_kind, "webhook delivered");
            }
            Ok(response) => {
                warn!(
                    %url,
                    event = event_kind,
                    status = %response.status(),
                    "webhook rejected; not retrying"
                );
            }
            Err(err) => {
                warn!(%url, event = event_kind, error = %err, "webhook delivery failed; not retrying");
            }
        }
    }
}
