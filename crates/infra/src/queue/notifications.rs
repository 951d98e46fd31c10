//! Relay of producer-side notifications straight onto the stream.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use datlake_events::{BroadcastEvent, decode_notification};

use super::store::{QueueItem, WorkQueueStore};
use crate::broadcast::EventPublisher;

/// Leases notification documents and republishes them as broadcast events.
///
/// Notifications are best effort: every leased item is deleted, undecodable
/// ones included.
pub struct NotificationRelay<S> {
    store: S,
    publisher: EventPublisher,
    queue: String,
    batch_size: usize,
    poll_interval: Duration,
    visibility_window: Duration,
    error_backoff: Duration,
}

impl<S> NotificationRelay<S>
where
    S: WorkQueueStore,
{
    pub fn new(
        store: S,
        publisher: EventPublisher,
        queue: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            queue: queue.into(),
            batch_size: 10,
            poll_interval,
            visibility_window: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(queue = %self.queue, "notification relay started");

        loop {
            let leased = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                leased = self.store.lease(
                    &self.queue,
                    self.batch_size,
                    self.visibility_window,
                    self.poll_interval,
                ) => leased,
            };

            match leased {
                Ok(items) => {
                    for item in items {
                        self.relay(item).await;
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "failed to lease notifications");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(queue = %self.queue, "notification relay stopped");
    }

    /// Publish one notification and delete it.
    pub async fn relay(&self, item: QueueItem) {
        match decode_notification(&item.payload) {
            Ok(payload) => {
                debug!(message_id = %item.message_id, topic = %payload.topic(), "relaying notification");
                self.publisher.publish(BroadcastEvent::new(payload)).await;
            }
            Err(e) => {
                warn!(message_id = %item.message_id, error = %e, "discarding undecodable notification");
            }
        }

        if let Err(e) = self.store.delete(&self.queue, item.message_id).await {
            warn!(message_id = %item.message_id, error = %e, "failed to delete notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use datlake_events::{EventPayload, Topic};

    use super::*;
    use crate::queue::store::InMemoryQueueStore;

    const Q: &str = "lineage_notifications";

    #[tokio::test]
    async fn notifications_are_relayed_and_deleted() {
        let store = InMemoryQueueStore::arc();
        store
            .send(Q, json!({"type": "job_status", "job_name": "load", "run_id": "r1", "status": "running", "progress": 40}))
            .await
            .unwrap();
        store.send(Q, json!({"type": "deploy", "version": "1.2"})).await.unwrap();
        store.send(Q, json!(42)).await.unwrap();

        let (publisher, mut rx) = EventPublisher::channel(8);
        let relay = Arc::new(NotificationRelay::new(
            store.clone(),
            publisher,
            Q,
            Duration::from_millis(10),
        ));
        let shutdown = CancellationToken::new();
        let task = {
            let relay = relay.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { relay.run(shutdown).await })
        };

        let first = rx.recv().await.unwrap();
        match first.payload() {
            EventPayload::JobStatus(status) => assert_eq!(status.progress, Some(40)),
            other => panic!("unexpected payload {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic(), Topic::SystemMetric);
        assert_eq!(second.data_json()["data"]["metric_type"], "notification");

        while store.length(Q).await.unwrap() > 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
