//! Operator endpoints for stream and queue health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use datlake_core::SessionId;
use datlake_events::{BroadcastEvent, EventPayload, Topic};
use datlake_infra::CoreRuntime;

use crate::app::errors::core_error_to_response;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub topic: String,
    pub data: JsonValue,
    /// Only these sessions receive the event when present.
    #[serde(default)]
    pub target_sessions: Option<Vec<String>>,
}

pub fn router() -> Router {
    Router::new()
        .route("/stream/stats", get(stream_stats))
        .route("/stream/zombies", get(zombie_report))
        .route("/stream/zombies/cleanup", post(cleanup_zombies))
        .route("/stream/broadcast", post(broadcast_event))
        .route("/queue/stats", get(queue_stats))
}

/// GET /admin/stream/stats
pub async fn stream_stats(Extension(runtime): Extension<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(runtime.broadcaster().stats())
}

/// GET /admin/stream/zombies
pub async fn zombie_report(Extension(runtime): Extension<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(runtime.broadcaster().zombie_report())
}

/// POST /admin/stream/zombies/cleanup
///
/// Evict every zombie session now, without waiting for its grace period.
pub async fn cleanup_zombies(Extension(runtime): Extension<Arc<CoreRuntime>>) -> impl IntoResponse {
    let report = runtime.broadcaster().cleanup_zombies();
    Json(json!({
        "message": format!("removed {} zombie sessions", report.zombies_removed),
        "zombies_before": report.zombies_before,
        "zombies_removed": report.zombies_removed,
    }))
}

/// POST /admin/stream/broadcast
///
/// Publish an operator supplied event, optionally to a fixed set of sessions.
pub async fn broadcast_event(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
    Json(req): Json<BroadcastRequest>,
) -> axum::response::Response {
    let payload = match req
        .topic
        .parse::<Topic>()
        .and_then(|topic| EventPayload::from_topic(topic, req.data))
    {
        Ok(payload) => payload,
        Err(e) => return core_error_to_response(e),
    };
    let targets = match req.target_sessions.as_deref().map(|ids| {
        ids.iter()
            .map(|id| id.parse::<SessionId>())
            .collect::<Result<Vec<_>, _>>()
    }) {
        None => None,
        Some(Ok(ids)) => Some(ids),
        Some(Err(e)) => return core_error_to_response(e),
    };

    let event = BroadcastEvent::new(payload);
    let event_id = event.id();
    let topic = event.topic();
    let broadcaster = runtime.broadcaster();
    let report = match &targets {
        Some(ids) => broadcaster.publish_to(event, ids),
        None => broadcaster.publish(event),
    };
    info!(
        %event_id,
        %topic,
        targeted = targets.is_some(),
        delivered = report.delivered,
        "custom event broadcast"
    );

    Json(json!({
        "message": "event broadcast",
        "event_id": event_id,
        "delivered": report.delivered,
        "dropped": report.dropped,
    }))
    .into_response()
}

/// GET /admin/queue/stats
pub async fn queue_stats(Extension(runtime): Extension<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(json!({
        "state": runtime.consumer_state(),
        "stats": runtime.consumer_stats(),
    }))
}
