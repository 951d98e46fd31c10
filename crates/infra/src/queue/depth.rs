//! Periodic queue depth reporting.

use std::time::Duration;

use metrics::gauge;
use serde_json::{Map, Value as JsonValue, json};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use datlake_events::{BroadcastEvent, SystemMetric};
use datlake_observability::metrics::QUEUE_DEPTH;

use super::store::WorkQueueStore;
use crate::broadcast::EventPublisher;

/// Publishes queue lengths as a `system-metric` event and a gauge.
pub struct QueueDepthReporter<S> {
    store: S,
    publisher: EventPublisher,
    queues: Vec<String>,
    interval: Duration,
}

impl<S> QueueDepthReporter<S>
where
    S: WorkQueueStore,
{
    pub fn new(store: S, publisher: EventPublisher, queues: Vec<String>, interval: Duration) -> Self {
        Self {
            store,
            publisher,
            queues,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(queues = ?self.queues, "queue depth reporter started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }

        info!("queue depth reporter stopped");
    }

    /// Read every queue once. Queues that cannot be read are skipped.
    pub async fn report(&self) -> Option<u64> {
        let mut per_queue = Map::new();
        let mut total = 0u64;

        for queue in &self.queues {
            match self.store.length(queue).await {
                Ok(len) => {
                    gauge!(QUEUE_DEPTH, "queue" => queue.clone()).set(len as f64);
                    per_queue.insert(queue.clone(), json!(len));
                    total += len;
                }
                Err(e) => warn!(queue = %queue, error = %e, "failed to read queue depth"),
            }
        }

        if per_queue.is_empty() {
            return None;
        }

        debug!(total, "queue depth");
        self.publisher
            .publish(BroadcastEvent::system_metric(SystemMetric {
                metric_type: "queue_depth".to_string(),
                value: JsonValue::from(total),
                metadata: per_queue,
            }))
            .await;
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::queue::store::InMemoryQueueStore;

    #[tokio::test]
    async fn reports_total_and_per_queue_counts() {
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", json!(1)).await.unwrap();
        store.send("lineage_events", json!(2)).await.unwrap();
        store.send("lineage_events_dlq", json!(3)).await.unwrap();

        let (publisher, mut rx) = EventPublisher::channel(4);
        let reporter = QueueDepthReporter::new(
            store,
            publisher,
            vec!["lineage_events".into(), "lineage_events_dlq".into()],
            Duration::from_secs(30),
        );

        assert_eq!(reporter.report().await, Some(3));
        let event = rx.recv().await.unwrap();
        let data = &event.data_json()["data"];
        assert_eq!(data["metric_type"], "queue_depth");
        assert_eq!(data["value"], 3);
        assert_eq!(data["metadata"], json!({"lineage_events": 2, "lineage_events_dlq": 1}));
    }
}
