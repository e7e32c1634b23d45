//! Service transport port and wire frame shapes.
//!
//! The engine dispatches tasks over a long-lived bidirectional connection
//! per registered service. The concrete hub lives in
//! `infrastructure::transport`; tests substitute an in-process double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error type for dispatch operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live session for the service; the caller should pause and retry.
    #[error("Service not connected: {0}")]
    NotConnected(String),

    #[error("Send failed for service {service_id}: {reason}")]
    SendFailed { service_id: String, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// Context sent with a compensation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationContext {
    pub orchestration_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Frames the engine sends to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "task_request", rename_all = "camelCase")]
    TaskRequest {
        id: String,
        execution_id: String,
        idempotency_key: String,
        service_id: String,
        input: Value,
        status: String,
    },
    #[serde(rename = "compensation_request", rename_all = "camelCase")]
    CompensationRequest {
        id: String,
        execution_id: String,
        idempotency_key: String,
        service_id: String,
        input: Value,
        compensation_context: CompensationContext,
        status: String,
    },
    #[serde(rename = "ping", rename_all = "camelCase")]
    Ping { service_id: String },
    #[serde(rename = "ACK")]
    Ack { id: String },
}

impl OutboundFrame {
    pub fn task_request(
        id: impl Into<String>,
        execution_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        service_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::TaskRequest {
            id: id.into(),
            execution_id: execution_id.into(),
            idempotency_key: idempotency_key.into(),
            service_id: service_id.into(),
            input,
            status: "processing".into(),
        }
    }

    pub fn compensation_request(
        id: impl Into<String>,
        execution_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        service_id: impl Into<String>,
        input: Value,
        context: CompensationContext,
    ) -> Self {
        Self::CompensationRequest {
            id: id.into(),
            execution_id: execution_id.into(),
            idempotency_key: idempotency_key.into(),
            service_id: service_id.into(),
            input,
            compensation_context: context,
            status: "processing".into(),
        }
    }
}

/// Payload types a service sends back.
pub mod result_type {
    pub const PONG: &str = "pong";
    pub const TASK_STATUS: &str = "task_status";
    pub const TASK_INTERIM_RESULT: &str = "task_interim_result";
    pub const TASK_ABORT_RESULT: &str = "task_abort_result";
    pub const TASK_RESULT: &str = "task_result";
}

/// The result payload of an inbound service message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Inbound messages arrive wrapped with a message id; every non-pong
/// message must be acknowledged with an `ACK` carrying that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub id: String,
    pub payload: TaskResult,
}

/// Port interface for dispatching frames and reading service health.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    /// Send a frame to the service's live session.
    async fn dispatch(&self, service_id: &str, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Whether the service currently has a live, responsive session.
    async fn is_service_healthy(&self, service_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_request_wire_shape() {
        let frame = OutboundFrame::task_request("m1", "e1", "k1", "s1", json!({"message": "hi"}));
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "task_request");
        assert_eq!(wire["executionId"], "e1");
        assert_eq!(wire["idempotencyKey"], "k1");
        assert_eq!(wire["serviceId"], "s1");
        assert_eq!(wire["status"], "processing");
    }

    #[test]
    fn test_ack_wire_shape() {
        let wire = serde_json::to_value(OutboundFrame::Ack { id: "m9".into() }).unwrap();
        assert_eq!(wire["type"], "ACK");
        assert_eq!(wire["id"], "m9");
    }

    #[test]
    fn test_inbound_envelope_parses() {
        let raw = json!({
            "id": "msg-1",
            "payload": {
                "type": "task_result",
                "taskId": "task1",
                "executionId": "e1",
                "serviceId": "s1",
                "idempotencyKey": "k1",
                "result": {"task": {"message": "hi"}}
            }
        });
        let envelope: InboundEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.payload.kind, result_type::TASK_RESULT);
        assert_eq!(envelope.payload.task_id, "task1");
    }
}
