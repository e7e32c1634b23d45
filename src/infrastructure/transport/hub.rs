//! WebSocket session hub.
//!
//! Accepts service connections at `/ws?serviceId=<id>&apiKey=<key>`,
//! authenticates them against the project registry, and keeps one live
//! session per service. Outbound frames go through a per-session channel;
//! inbound envelopes are ACKed (except pongs) and forwarded to the engine.
//! Health is pong-driven: a service is healthy while connected and seen
//! within the health window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ports::transport::{
    result_type, InboundEnvelope, OutboundFrame, ServiceTransport, TaskResult, TransportError,
};

/// Cadence of engine-initiated pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A service is healthy while connected and seen within this window.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(60);

/// Authorizes a session before the WebSocket upgrade completes.
#[async_trait]
pub trait SessionAuthorizer: Send + Sync {
    async fn authorize(&self, service_id: &str, api_key: &str) -> bool;
}

struct Session {
    sender: mpsc::UnboundedSender<Message>,
    last_seen: DateTime<Utc>,
}

/// The hub implementing [`ServiceTransport`] over WebSocket sessions.
pub struct WebSocketHub {
    sessions: RwLock<HashMap<String, Session>>,
    inbound: mpsc::UnboundedSender<TaskResult>,
}

impl WebSocketHub {
    /// Create the hub plus the receiver the engine drains for inbound
    /// results.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskResult>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: RwLock::new(HashMap::new()),
                inbound,
            }),
            rx,
        )
    }

    /// Accept connections until the token fires. Also runs the ping loop.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        authorizer: Arc<dyn SessionAuthorizer>,
        shutdown: CancellationToken,
    ) {
        let pinger = {
            let hub = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { hub.ping_loop(shutdown).await })
        };

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            debug!(%peer, "incoming connection");
            let hub = Arc::clone(&self);
            let authorizer = Arc::clone(&authorizer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = hub.handle_connection(stream, authorizer, shutdown).await {
                    debug!(%peer, error = %err, "session ended");
                }
            });
        }
        pinger.abort();
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        authorizer: Arc<dyn SessionAuthorizer>,
        shutdown: CancellationToken,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut credentials: Option<(String, String)> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                match parse_session_query(request.uri().query().unwrap_or_default()) {
                    Some(parsed) => {
                        credentials = Some(parsed);
                        Ok(response)
                    }
                    None => Err(ErrorResponse::new(Some(
                        "missing serviceId or apiKey".into(),
                    ))),
                }
            },
        )
        .await?;

        let Some((service_id, api_key)) = credentials else {
            return Ok(());
        };
        if !authorizer.authorize(&service_id, &api_key).await {
            warn!(%service_id, "session refused: invalid credentials");
            return Ok(());
        }

        let (sender, mut outbox) = mpsc::unbounded_channel::<Message>();
        self.register_session(&service_id, sender).await;
        info!(%service_id, "service session established");

        let (mut sink, mut source) = ws_stream.split();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let message = tokio::select! {
                () = shutdown.cancelled() => break,
                message = source.next() => match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(%service_id, error = %err, "read error");
                        break;
                    }
                    None => break,
                },
            };
            match message {
                Message::Text(text) => self.handle_inbound(&service_id, &text).await,
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        self.handle_inbound(&service_id, &text).await;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        writer.abort();
        self.remove_session(&service_id).await;
        info!(%service_id, "service session closed");
        Ok(())
    }

    /// Parse, ACK (except pongs), and forward one inbound envelope.
    async fn handle_inbound(&self, service_id: &str, text: &str) {
        self.touch(service_id).await;
        let envelope: InboundEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(service_id, error = %err, "unparseable inbound message");
                return;
            }
        };
        if envelope.payload.kind != result_type::PONG {
            let ack = OutboundFrame::Ack {
                id: envelope.id.clone(),
            };
            if let Err(err) = self.dispatch(service_id, ack).await {
                debug!(service_id, error = %err, "failed to ACK");
            }
            let _ = self.inbound.send(envelope.payload);
        }
    }

    async fn ping_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let service_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
            for service_id in service_ids {
                let ping = OutboundFrame::Ping {
                    service_id: service_id.clone(),
                };
                if let Err(err) = self.dispatch(&service_id, ping).await {
                    debug!(%service_id, error = %err, "ping dispatch failed");
                }
            }
        }
    }

    /// Register a live session, replacing any previous one for the service.
    pub(crate) async fn register_session(
        &self,
        service_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) {
        self.sessions.write().await.insert(
            service_id.to_string(),
            Session {
                sender,
                last_seen: Utc::now(),
            },
        );
    }

    pub(crate) async fn remove_session(&self, service_id: &str) {
        self.sessions.write().await.remove(service_id);
    }

    async fn touch(&self, service_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(service_id) {
            session.last_seen = Utc::now();
        }
    }
}

#[async_trait]
impl ServiceTransport for WebSocketHub {
    async fn dispatch(&self, service_id: &str, frame: OutboundFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(&frame).map_err(|err| TransportError::SendFailed {
            service_id: service_id.to_string(),
            reason: err.to_string(),
        })?;
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(service_id) else {
            return Err(TransportError::NotConnected(service_id.to_string()));
        };
        session
            .sender
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected(service_id.to_string()))
    }

    async fn is_service_healthy(&self, service_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(service_id) else {
            return false;
        };
        let window = chrono::Duration::from_std(HEALTH_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - session.last_seen <= window
    }
}

/// Parse `serviceId` and `apiKey` from a WebSocket upgrade query string.
pub fn parse_session_query(query: &str) -> Option<(String, String)> {
    let mut service_id = None;
    let mut api_key = None;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "serviceId" => service_id = Some(value.to_string()),
            "apiKey" => api_key = Some(value.to_string()),
            _ => {}
        }
    }
    match (service_id, api_key) {
        (Some(service_id), Some(api_key)) if !service_id.is_empty() && !api_key.is_empty() => {
            Some((service_id, api_key))
        }
        _ => None,
    }
}
