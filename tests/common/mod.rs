//! Shared fixtures for integration tests: an in-process service transport
//! double, plan response builders, and a webhook capture server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use orra::domain::models::{Schema, Service, ServiceKind, ServiceSchema, Status};
use orra::domain::ports::plan_validator::AcceptAllValidator;
use orra::domain::ports::reasoning::ScriptedReasoningClient;
use orra::domain::ports::storage::InMemoryStorage;
use orra::domain::ports::transport::{OutboundFrame, ServiceTransport, TransportError};
use orra::domain::ports::TrigramEmbeddingClient;
use orra::services::IdempotencyStore;
use orra::PlanEngine;

/// How a fake service answers task dispatches.
#[derive(Clone)]
pub enum Behavior {
    /// Respond with `{"task": <input>}`.
    EchoTask,
    /// Respond with `{"task": <input>, "compensation": {...}}`.
    EchoWithCompensation { ttl_ms: u64 },
    /// Fail every attempt with the given message.
    AlwaysFail(String),
    /// Abort with the given payload.
    Abort(Value),
}

/// In-process transport double acting as every registered service.
pub struct FakeTransport {
    stores: Mutex<HashMap<String, Arc<IdempotencyStore>>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    unhealthy: Mutex<HashSet<String>>,
    pub compensation_dispatches: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stores: Mutex::new(HashMap::new()),
            behaviors: Mutex::new(HashMap::new()),
            unhealthy: Mutex::new(HashSet::new()),
            compensation_dispatches: Mutex::new(Vec::new()),
        })
    }

    /// Connect a fake service: wire its idempotency store and behavior.
    pub async fn connect(
        &self,
        service_id: &str,
        store: Arc<IdempotencyStore>,
        behavior: Behavior,
    ) {
        self.stores.lock().await.insert(service_id.to_string(), store);
        self.behaviors
            .lock()
            .await
            .insert(service_id.to_string(), behavior);
    }

    pub async fn set_unhealthy(&self, service_id: &str, unhealthy: bool) {
        let mut set = self.unhealthy.lock().await;
        if unhealthy {
            set.insert(service_id.to_string());
        } else {
            set.remove(service_id);
        }
    }

}

#[async_trait]
impl ServiceTransport for FakeTransport {
    async fn dispatch(&self, service_id: &str, frame: OutboundFrame) -> Result<(), TransportError> {
        let stores = self.stores.lock().await;
        let Some(store) = stores.get(service_id).cloned() else {
            return Err(TransportError::NotConnected(service_id.to_string()));
        };
        drop(stores);

        match frame {
            OutboundFrame::TaskRequest {
                idempotency_key,
                execution_id,
                input,
                ..
            } => {
                let behavior = self
                    .behaviors
                    .lock()
                    .await
                    .get(service_id)
                    .cloned()
                    .unwrap_or(Behavior::EchoTask);
                match behavior {
                    Behavior::EchoTask => {
                        let payload = json!({ "task": input });
                        store
                            .update_execution_result(
                                &idempotency_key,
                                &execution_id,
                                Some(serde_json::to_vec(&payload).unwrap()),
                                None,
                            )
                            .await;
                    }
                    Behavior::EchoWithCompensation { ttl_ms } => {
                        let payload = json!({
                            "task": input,
                            "compensation": {
                                "input": { "undo": input },
                                "ttl_ms": ttl_ms,
                            }
                        });
                        store
                            .update_execution_result(
                                &idempotency_key,
                                &execution_id,
                                Some(serde_json::to_vec(&payload).unwrap()),
                                None,
                            )
                            .await;
                    }
                    Behavior::AlwaysFail(message) => {
                        store
                            .update_execution_result(
                                &idempotency_key,
                                &execution_id,
                                None,
                                Some(message),
                            )
                            .await;
                    }
                    Behavior::Abort(payload) => {
                        store
                            .track_abort_result(
                                &idempotency_key,
                                &execution_id,
                                serde_json::to_vec(&payload).unwrap(),
                            )
                            .await;
                    }
                }
            }
            OutboundFrame::CompensationRequest {
                idempotency_key,
                execution_id,
                ..
            } => {
                self.compensation_dispatches
                    .lock()
                    .await
                    .push(service_id.to_string());
                store
                    .update_execution_result(
                        &idempotency_key,
                        &execution_id,
                        Some(serde_json::to_vec(&json!({"status": "completed"})).unwrap()),
                        None,
                    )
                    .await;
            }
            OutboundFrame::Ping { .. } | OutboundFrame::Ack { .. } => {}
        }
        Ok(())
    }

    async fn is_service_healthy(&self, service_id: &str) -> bool {
        if self.unhealthy.lock().await.contains(service_id) {
            return false;
        }
        self.stores.lock().await.contains_key(service_id)
    }
}

/// An engine over in-memory ports with scripted generator responses.
pub fn build_engine(
    responses: Vec<String>,
    transport: Arc<FakeTransport>,
) -> (Arc<PlanEngine>, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = PlanEngine::new(
        Arc::clone(&storage) as Arc<dyn orra::domain::ports::storage::Storage>,
        transport,
        Arc::new(ScriptedReasoningClient::new(responses)),
        Arc::new(TrigramEmbeddingClient::default()),
        Arc::new(AcceptAllValidator),
    );
    (engine, storage)
}

/// A service whose input and output schemas both declare the given string
/// fields.
pub fn service_with_fields(
    id: &str,
    project_id: &str,
    name: &str,
    fields: &[&str],
    revertible: bool,
) -> Service {
    let mut props = BTreeMap::new();
    for field in fields {
        props.insert((*field).to_string(), Schema::of_kind("string"));
    }
    let mut service = Service::new(
        project_id,
        name,
        ServiceKind::Service,
        format!("{name}: handles {}", fields.join(", ")),
        ServiceSchema {
            input: Schema::object(props.clone()),
            output: Schema::object(props),
        },
        revertible,
    );
    service.id = id.to_string();
    service
}

/// Wrap a plan JSON value in the generator's fenced response format.
pub fn fenced(plan: &Value) -> String {
    format!("```json\n{plan}\n```")
}

/// Poll until the orchestration reaches `expected` or the budget runs out.
pub async fn wait_for_status(
    engine: &Arc<PlanEngine>,
    orchestration_id: &str,
    expected: Status,
    budget: Duration,
) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Some(orchestration) = engine.get_orchestration(orchestration_id).await {
            if orchestration.status == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "orchestration {orchestration_id} did not reach {expected:?} within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A captured webhook delivery: the `X-Orra-Event` header and JSON body.
pub type CapturedWebhook = (String, Value);

/// Minimal HTTP server capturing webhook POSTs and answering 200.
pub async fn spawn_webhook_capture() -> (String, mpsc::UnboundedReceiver<CapturedWebhook>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0_u8; 4096];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(captured) = parse_request(&buf) {
                        let _ = tx.send(captured);
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                            .await;
                        return;
                    }
                }
            });
        }
    });

    (format!("http://{addr}/hook"), rx)
}

fn parse_request(buf: &[u8]) -> Option<CapturedWebhook> {
    let text = String::from_utf8_lossy(buf);
    let header_end = text.find("\r\n\r\n")?;
    let headers = &text[..header_end];
    let mut event = String::new();
    let mut content_length = 0_usize;
    for line in headers.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("x-orra-event") {
            event = value.to_string();
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        }
    }
    let body = &buf[header_end + 4..];
    if body.len() < content_length {
        return None;
    }
    let body: Value = serde_json::from_slice(&body[..content_length]).ok()?;
    Some((event, body))
}
