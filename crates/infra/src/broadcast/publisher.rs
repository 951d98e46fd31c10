//! Message-passing handle used by producers (queue consumer, relays) to hand
//! events to the broadcaster without holding a reference to it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use datlake_events::BroadcastEvent;

use super::broadcaster::Broadcaster;

/// Cloneable producer side of the broadcaster's inbound channel.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<BroadcastEvent>,
}

impl EventPublisher {
    /// Create a publisher and the receiver the broadcaster pump drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hand an event to the broadcaster.
    ///
    /// Waits while the inbound channel is full. Once the broadcaster has shut
    /// down the event is dropped.
    pub async fn publish(&self, event: BroadcastEvent) {
        let topic = event.topic();
        if self.tx.send(event).await.is_err() {
            debug!(%topic, "broadcaster stopped; event dropped");
        }
    }
}

/// Drain the inbound channel into the broadcaster until shutdown.
///
/// On shutdown, events already buffered in the channel are still published
/// before the pump exits.
pub async fn run_pump(
    broadcaster: Arc<Broadcaster>,
    mut rx: mpsc::Receiver<BroadcastEvent>,
    shutdown: CancellationToken,
) {
    info!("broadcast pump started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => {
                    broadcaster.publish(event);
                }
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(event) = rx.try_recv() {
        broadcaster.publish(event);
    }

    info!("broadcast pump stopped");
}
