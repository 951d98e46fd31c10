//! SSE response body fed by a session's delivery loop.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::response::sse::Event as SseEvent;
use tokio::sync::mpsc;

use datlake_events::BroadcastEvent;
use datlake_infra::broadcast::{SessionTransport, TransportError};

pub type SseItem = Result<SseEvent, Infallible>;

/// Writes broadcast events into the channel backing an SSE response.
///
/// Once the client disconnects Axum drops the response stream, the receiver
/// goes with it and every further write reports [`TransportError::Closed`].
pub struct ChannelTransport {
    tx: mpsc::Sender<SseItem>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<SseItem>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn write(&mut self, event: &BroadcastEvent) -> Result<(), TransportError> {
        self.tx
            .send(Ok(to_sse(event)))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// `id:` / `event:` / `data:` record for one broadcast event.
pub fn to_sse(event: &BroadcastEvent) -> SseEvent {
    SseEvent::default()
        .id(event.id().to_string())
        .event(event.topic().as_str())
        .data(event.data_json().to_string())
}
