//! Realtime event stream over Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, sse::Event as SseEvent, sse::Sse},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use datlake_core::{ProbeId, SessionId};
use datlake_events::Topic;
use datlake_infra::CoreRuntime;
use datlake_infra::broadcast::AckOutcome;

use crate::app::errors::{core_error_to_response, json_error};
use crate::app::transport::ChannelTransport;

/// Response header carrying the new session's id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Frames buffered between the delivery loop and the HTTP body.
const BODY_BUFFER: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Request DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Comma separated topic names; empty means the default subscription.
    pub topics: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub session_id: String,
    pub probe_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/stream", get(stream_events))
        .route("/lineage", get(stream_lineage))
        .route("/jobs", get(stream_jobs))
        .route("/metrics", get(stream_metrics))
        .route("/ack", post(acknowledge_probe))
        .route("/sessions/:id", delete(disconnect_session))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /events/stream?topics=job-status,error
///
/// Opens a session and streams its events. The first frame is a `session`
/// record carrying the session id the client uses to acknowledge probes.
pub async fn stream_events(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
    Query(params): Query<StreamParams>,
) -> axum::response::Response {
    match Topic::parse_list(params.topics.as_deref().unwrap_or_default()) {
        Ok(topics) => open_session(&runtime, topics),
        Err(e) => core_error_to_response(e),
    }
}

/// GET /events/lineage
pub async fn stream_lineage(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
) -> axum::response::Response {
    open_session(&runtime, vec![Topic::QueueItemProcessed, Topic::Error])
}

/// GET /events/jobs
pub async fn stream_jobs(Extension(runtime): Extension<Arc<CoreRuntime>>) -> axum::response::Response {
    open_session(&runtime, vec![Topic::JobStatus, Topic::Error])
}

/// GET /events/metrics
pub async fn stream_metrics(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
) -> axum::response::Response {
    open_session(&runtime, vec![Topic::SystemMetric, Topic::Error])
}

fn open_session(runtime: &CoreRuntime, topics: Vec<Topic>) -> axum::response::Response {
    let broadcaster = runtime.broadcaster();
    let subscription = broadcaster.subscribe(topics);
    let session_id = subscription.id();
    let subscribed: Vec<&str> = subscription
        .session
        .topics()
        .iter()
        .map(Topic::as_str)
        .collect();

    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(BODY_BUFFER);
    let hello = SseEvent::default().event("session").data(
        json!({
            "session_id": session_id,
            "topics": subscribed,
        })
        .to_string(),
    );
    // Fresh channel with spare capacity; this cannot fail.
    let _ = tx.try_send(Ok(hello));

    broadcaster.spawn_delivery(subscription, ChannelTransport::new(tx));
    info!(%session_id, "event stream opened");

    let header = match HeaderValue::from_str(&session_id.to_string()) {
        Ok(value) => value,
        Err(e) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string());
        }
    };

    (
        [(HeaderName::from_static(SESSION_HEADER), header)],
        Sse::new(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// POST /events/ack
///
/// Acknowledge a liveness probe.
pub async fn acknowledge_probe(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
    Json(req): Json<AckRequest>,
) -> axum::response::Response {
    let session_id = match req.session_id.parse::<SessionId>() {
        Ok(id) => id,
        Err(e) => return core_error_to_response(e),
    };
    let probe_id = match req.probe_id.parse::<ProbeId>() {
        Ok(id) => id,
        Err(e) => return core_error_to_response(e),
    };

    match runtime.broadcaster().acknowledge_probe(session_id, probe_id) {
        AckOutcome::Accepted => Json(json!({ "status": "accepted" })).into_response(),
        AckOutcome::UnknownSession => json_error(
            StatusCode::NOT_FOUND,
            "unknown_session",
            format!("no session {session_id}"),
        ),
        AckOutcome::UnknownProbe => json_error(
            StatusCode::CONFLICT,
            "unknown_probe",
            format!("probe {probe_id} is not outstanding for session {session_id}"),
        ),
    }
}

/// DELETE /events/sessions/:id
pub async fn disconnect_session(
    Extension(runtime): Extension<Arc<CoreRuntime>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id = match id.parse::<SessionId>() {
        Ok(id) => id,
        Err(e) => return core_error_to_response(e),
    };

    if runtime.broadcaster().unsubscribe(session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        json_error(
            StatusCode::NOT_FOUND,
            "unknown_session",
            format!("no session {session_id}"),
        )
    }
}
