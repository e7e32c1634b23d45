//! Service transport: the WebSocket hub.
//!
//! Every registered service dials in over a long-lived WebSocket carrying
//! task dispatch, acknowledgements, pongs, interim results, and final
//! results. The hub owns per-service sessions and health; inbound payloads
//! are forwarded to the engine through a channel.

mod hub;

pub use hub::{parse_session_query, SessionAuthorizer, WebSocketHub, HEALTH_WINDOW, PING_INTERVAL};

use async_trait::async_trait;

/// Sessions authenticate against the engine's registries: the service must
/// exist and the API key must belong to its project.
#[async_trait]
impl SessionAuthorizer for crate::services::engine::PlanEngine {
    async fn authorize(&self, service_id: &str, api_key: &str) -> bool {
        let Some(service) = self.get_service(service_id).await else {
            return false;
        };
        self.project_by_api_key(api_key)
            .await
            .is_some_and(|project| project.id == service.project_id)
    }
}
