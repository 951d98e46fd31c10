//! Queue consumer with dead-letter handling.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use datlake_events::{BroadcastEvent, LineageEvent, ProcessingOutcome};
use datlake_observability::metrics::{
    QUEUE_DEAD_LETTERED, QUEUE_ITEMS_PROCESSED, QUEUE_LEASE_FAILURES, QUEUE_PROCESSING_DURATION,
};

use super::ConsumerConfig;
use super::dead_letter::DeadLetterRecord;
use super::processor::EventProcessor;
use super::store::{QueueItem, WorkQueueStore};
use crate::broadcast::EventPublisher;

/// Lifecycle of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Running,
    /// Shutdown requested; the current batch is being finished.
    Draining,
    Stopped,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub items_dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub lease_failures: u64,
}

/// Leases lineage events, runs the processor and reports every outcome.
///
/// Delivery is at-least-once: an item is deleted only after it was
/// processed, or in the same store operation that writes it to the
/// dead-letter queue. A crash in between leads to redelivery once the
/// visibility window expires, and a failed item lands in the dead-letter
/// queue exactly once.
pub struct QueueConsumer<S, P> {
    store: S,
    processor: P,
    publisher: EventPublisher,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl<S, P> QueueConsumer<S, P>
where
    S: WorkQueueStore,
    P: EventProcessor,
{
    pub fn new(store: S, processor: P, publisher: EventPublisher, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Running);
        Self {
            store,
            processor,
            publisher,
            config,
            state,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Shared handle to the running counters.
    pub fn stats_handle(&self) -> Arc<Mutex<ConsumerStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().clone()
    }

    /// Consume until `shutdown` fires.
    ///
    /// A lease failure never ends the loop: it is logged, reported as an
    /// `error` event and retried after the configured backoff.
    pub async fn run(&self, shutdown: CancellationToken) {
        let queue = self.config.queue_name.as_str();
        info!(
            queue,
            dead_letter_queue = %self.config.dead_letter_queue,
            batch_size = self.config.batch_size,
            "queue consumer started"
        );
        self.state.send_replace(ConsumerState::Running);

        loop {
            let leased = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                leased = self.store.lease(
                    queue,
                    self.config.batch_size,
                    self.config.visibility_window,
                    self.config.poll_interval,
                ) => leased,
            };

            let items = match leased {
                Ok(items) => items,
                Err(e) => {
                    error!(queue, error = %e, "failed to lease from queue");
                    counter!(QUEUE_LEASE_FAILURES).increment(1);
                    self.stats.lock().lease_failures += 1;
                    self.publisher
                        .publish(BroadcastEvent::error(
                            "queue_unavailable",
                            "queue store unreachable; retrying",
                        ))
                        .await;

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => continue,
                    }
                }
            };

            if items.is_empty() {
                continue;
            }
            debug!(queue, count = items.len(), "leased batch");

            // A leased batch is always finished; its items are invisible to
            // other consumers until the visibility window runs out.
            for item in items {
                if shutdown.is_cancelled() {
                    self.state.send_if_modified(|s| {
                        let changed = *s != ConsumerState::Draining;
                        *s = ConsumerState::Draining;
                        changed
                    });
                }
                self.handle(item).await;
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        info!(queue, "queue consumer stopped");
    }

    /// Process one item end to end and publish its outcome.
    pub async fn handle(&self, item: QueueItem) -> ProcessingOutcome {
        let outcome = self.process_item(&item).await;

        histogram!(QUEUE_PROCESSING_DURATION).record(outcome.duration.as_secs_f64());
        counter!(
            QUEUE_ITEMS_PROCESSED,
            "event_type" => outcome.event_type.clone(),
            "status" => if outcome.success { "completed" } else { "failed" }
        )
        .increment(1);

        {
            let mut stats = self.stats.lock();
            stats.items_processed += 1;
            if outcome.success {
                stats.items_succeeded += 1;
            } else {
                stats.items_failed += 1;
            }
        }

        if outcome.success {
            self.acknowledge(&item).await;
        } else {
            let error = outcome.error.as_deref().unwrap_or("processing failed");
            self.dead_letter(&item, error).await;
            self.publisher
                .publish(BroadcastEvent::error(
                    "lineage_processing_error",
                    format!("failed to process message {}", item.message_id),
                ))
                .await;
        }

        self.publisher.publish(outcome.to_event()).await;
        outcome
    }

    async fn process_item(&self, item: &QueueItem) -> ProcessingOutcome {
        let started = Instant::now();

        let event = match LineageEvent::decode(&item.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(message_id = %item.message_id, error = %e, "undecodable queue item");
                return ProcessingOutcome::undecodable(item.message_id, e.to_string());
            }
        };

        match self.processor.process(&event).await {
            Ok(true) => ProcessingOutcome::succeeded(&event, item.message_id, started.elapsed()),
            Ok(false) => ProcessingOutcome::failed(
                &event,
                item.message_id,
                started.elapsed(),
                "processing failed",
            ),
            Err(e) => {
                warn!(
                    message_id = %item.message_id,
                    run_id = %event.run_id(),
                    error = %e,
                    "event processor failed"
                );
                ProcessingOutcome::failed(&event, item.message_id, started.elapsed(), e.to_string())
            }
        }
    }

    async fn acknowledge(&self, item: &QueueItem) {
        let queue = &self.config.queue_name;
        match self.store.delete(queue, item.message_id).await {
            Ok(true) => debug!(message_id = %item.message_id, "queue item completed"),
            Ok(false) => debug!(message_id = %item.message_id, "queue item already deleted"),
            // Redelivered after the visibility window; processing is idempotent.
            Err(e) => warn!(message_id = %item.message_id, error = %e, "failed to delete processed item"),
        }
    }

    async fn dead_letter(&self, item: &QueueItem, error: &str) {
        let queue = &self.config.queue_name;
        let dlq = &self.config.dead_letter_queue;
        let record = DeadLetterRecord::new(item, queue.as_str(), error);

        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message_id = %item.message_id, error = %e, "failed to encode dead-letter record");
                self.stats.lock().dead_letter_failures += 1;
                return;
            }
        };

        match self
            .store
            .dead_letter(queue, dlq, item.message_id, payload)
            .await
        {
            Ok(Some(dlq_id)) => {
                counter!(QUEUE_DEAD_LETTERED).increment(1);
                self.stats.lock().items_dead_lettered += 1;
                warn!(message_id = %item.message_id, %dlq_id, error, "queue item dead-lettered");
            }
            Ok(None) => debug!(message_id = %item.message_id, "queue item already gone; not dead-lettered"),
            Err(e) => {
                // Nothing moved; the item comes back after the visibility window.
                error!(message_id = %item.message_id, error = %e, "failed to dead-letter item");
                self.stats.lock().dead_letter_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::{Semaphore, mpsc};

    use datlake_events::{EventPayload, ItemStatus, Topic};

    use super::*;
    use crate::queue::processor::ProcessorError;
    use crate::queue::store::InMemoryQueueStore;

    /// Rejects events whose job name starts with `bad`; counts calls per run id.
    #[derive(Default)]
    struct Selective {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventProcessor for Selective {
        async fn process(&self, event: &LineageEvent) -> Result<bool, ProcessorError> {
            self.calls.lock().push(event.run_id().to_string());
            if event.job_name().starts_with("bad") {
                return Err(ProcessorError::Failed("schema mismatch".into()));
            }
            Ok(!event.job_name().starts_with("reject"))
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventProcessor for Counting {
        async fn process(&self, _event: &LineageEvent) -> Result<bool, ProcessorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Reports each call, then blocks until the test hands out a permit.
    struct Gated {
        started: mpsc::UnboundedSender<String>,
        permits: Semaphore,
    }

    #[async_trait]
    impl EventProcessor for Gated {
        async fn process(&self, event: &LineageEvent) -> Result<bool, ProcessorError> {
            let _ = self.started.send(event.run_id().to_string());
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
            Ok(true)
        }
    }

    fn lineage(run: &str, job: &str) -> JsonValue {
        json!({
            "eventType": "COMPLETE",
            "eventTime": "2026-01-01T00:00:00Z",
            "run": {"runId": run},
            "job": {"namespace": "warehouse", "name": job},
            "inputs": [],
            "outputs": [],
        })
    }

    fn consumer<P: EventProcessor>(
        store: Arc<InMemoryQueueStore>,
        processor: P,
    ) -> (QueueConsumer<Arc<InMemoryQueueStore>, P>, mpsc::Receiver<BroadcastEvent>) {
        let (publisher, rx) = EventPublisher::channel(64);
        let config = ConsumerConfig {
            poll_interval: Duration::from_millis(10),
            ..ConsumerConfig::default()
        };
        (QueueConsumer::new(store, processor, publisher, config), rx)
    }

    async fn lease_one(store: &InMemoryQueueStore) -> QueueItem {
        store
            .lease("lineage_events", 1, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    fn drain(rx: &mut mpsc::Receiver<BroadcastEvent>) -> Vec<BroadcastEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn processed_items_are_deleted_and_reported() {
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", lineage("r1", "orders")).await.unwrap();
        let (consumer, mut rx) = consumer(store.clone(), Selective::default());

        let outcome = consumer.handle(lease_one(&store).await).await;

        assert!(outcome.success);
        assert_eq!(outcome.correlation_id.as_deref(), Some("r1"));
        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match events[0].payload() {
            EventPayload::QueueItemProcessed(p) => {
                assert_eq!(p.status, ItemStatus::Completed);
                assert_eq!(p.job_name.as_deref(), Some("orders"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_items_move_to_the_dead_letter_queue() {
        let store = InMemoryQueueStore::arc();
        let original = lineage("r2", "bad_job");
        let id = store.send("lineage_events", original.clone()).await.unwrap();
        let (consumer, mut rx) = consumer(store.clone(), Selective::default());

        let outcome = consumer.handle(lease_one(&store).await).await;
        assert!(!outcome.success);

        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        let dead = store.messages("lineage_events_dlq");
        assert_eq!(dead.len(), 1);
        let record: DeadLetterRecord = serde_json::from_value(dead[0].1.clone()).unwrap();
        assert_eq!(record.original_message, original);
        assert_eq!(record.msg_id, id);
        assert_eq!(record.error, "schema mismatch");
        assert_eq!(record.source_queue, "lineage_events");

        let topics: Vec<_> = drain(&mut rx).iter().map(|e| e.topic()).collect();
        assert_eq!(topics, vec![Topic::Error, Topic::QueueItemProcessed]);
        assert_eq!(consumer.stats().items_dead_lettered, 1);
    }

    #[tokio::test]
    async fn rejected_and_undecodable_items_are_dead_lettered() {
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", lineage("r3", "reject_me")).await.unwrap();
        store.send("lineage_events", json!({"not": "lineage"})).await.unwrap();
        let (consumer, _rx) = consumer(store.clone(), Selective::default());

        let rejected = consumer.handle(lease_one(&store).await).await;
        assert_eq!(rejected.error.as_deref(), Some("processing failed"));

        let garbage = consumer.handle(lease_one(&store).await).await;
        assert_eq!(garbage.event_type, datlake_events::UNDECODABLE_EVENT_TYPE);
        assert!(!garbage.success);

        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_failed_move_is_retried_on_redelivery_without_duplicates() {
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", lineage("r6", "bad_job")).await.unwrap();
        let (consumer, _rx) = consumer(store.clone(), Selective::default());

        store.fail_next_deletes(1);
        consumer.handle(lease_one(&store).await).await;
        assert_eq!(store.length("lineage_events").await.unwrap(), 1);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 0);
        assert_eq!(consumer.stats().dead_letter_failures, 1);

        store.expire_leases("lineage_events");
        let again = lease_one(&store).await;
        assert_eq!(again.read_count, 2);
        consumer.handle(again).await;

        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 1);
        assert_eq!(consumer.stats().items_dead_lettered, 1);
    }

    #[tokio::test]
    async fn items_stay_queued_when_the_dead_letter_write_fails() {
        let store = InMemoryQueueStore::arc();
        let id = store.send("lineage_events", lineage("r7", "bad_job")).await.unwrap();
        let (consumer, mut rx) = consumer(store.clone(), Selective::default());

        store.fail_next_sends(1);
        let outcome = consumer.handle(lease_one(&store).await).await;

        assert!(!outcome.success);
        assert_eq!(store.messages("lineage_events")[0].0, id);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 0);
        assert_eq!(consumer.stats().dead_letter_failures, 1);
        assert_eq!(consumer.stats().items_dead_lettered, 0);

        let topics: Vec<_> = drain(&mut rx).iter().map(|e| e.topic()).collect();
        assert_eq!(topics, vec![Topic::Error, Topic::QueueItemProcessed]);
    }

    #[tokio::test]
    async fn processed_items_whose_delete_fails_are_redelivered() {
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", lineage("r8", "orders")).await.unwrap();
        let (consumer, _rx) = consumer(store.clone(), Selective::default());

        store.fail_next_deletes(1);
        assert!(consumer.handle(lease_one(&store).await).await.success);
        assert_eq!(store.length("lineage_events").await.unwrap(), 1);

        store.expire_leases("lineage_events");
        assert!(consumer.handle(lease_one(&store).await).await.success);
        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        assert_eq!(consumer.stats().items_succeeded, 2);
    }

    #[tokio::test]
    async fn shutdown_mid_batch_drains_before_stopping() {
        let store = InMemoryQueueStore::arc();
        for n in 0..3 {
            store
                .send("lineage_events", lineage(&format!("r{n}"), "orders"))
                .await
                .unwrap();
        }
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let processor = Arc::new(Gated {
            started: started_tx,
            permits: Semaphore::new(0),
        });
        let (consumer, _rx) = consumer(store.clone(), processor.clone());
        let consumer = Arc::new(consumer);
        let state = consumer.state();
        let shutdown = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        assert_eq!(started.recv().await.as_deref(), Some("r0"));
        assert_eq!(*state.borrow(), ConsumerState::Running);

        shutdown.cancel();
        processor.permits.add_permits(1);
        assert_eq!(started.recv().await.as_deref(), Some("r1"));
        assert_eq!(*state.borrow(), ConsumerState::Draining);

        processor.permits.add_permits(2);
        task.await.unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
        assert_eq!(consumer.stats().items_succeeded, 3);
        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivered_items_are_processed_again() {
        tokio::time::pause();
        let store = InMemoryQueueStore::arc();
        store.send("lineage_events", lineage("r4", "orders")).await.unwrap();
        let processor = Arc::new(Counting(AtomicUsize::new(0)));
        let (consumer, _rx) = consumer(store.clone(), processor.clone());

        // Lease without completing, as if the consumer crashed mid-item.
        let first = lease_one(&store).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = lease_one(&store).await;
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.read_count, 2);

        consumer.handle(second).await;
        consumer.handle(first).await;
        assert_eq!(processor.0.load(Ordering::SeqCst), 2);
        assert_eq!(store.length("lineage_events").await.unwrap(), 0);
        assert_eq!(store.length("lineage_events_dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_drains_the_queue_and_stops_on_shutdown() {
        let store = InMemoryQueueStore::arc();
        for n in 0..25 {
            store
                .send("lineage_events", lineage(&format!("r{n}"), "orders"))
                .await
                .unwrap();
        }
        let (consumer, mut rx) = consumer(store.clone(), Selective::default());
        let consumer = Arc::new(consumer);
        let mut state = consumer.state();
        let shutdown = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        let mut seen = 0;
        while seen < 25 {
            if rx.recv().await.map(|e| e.topic()) == Some(Topic::QueueItemProcessed) {
                seen += 1;
            }
        }
        assert_eq!(store.length("lineage_events").await.unwrap(), 0);

        shutdown.cancel();
        task.await.unwrap();
        state.changed().await.ok();
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
        assert_eq!(consumer.stats().items_succeeded, 25);
    }

    #[tokio::test]
    async fn lease_failures_publish_an_error_and_retry() {
        tokio::time::pause();
        let store = InMemoryQueueStore::arc();
        store.fail_next_leases(2);
        store.send("lineage_events", lineage("r5", "orders")).await.unwrap();
        let (consumer, mut rx) = consumer(store.clone(), Selective::default());
        let consumer = Arc::new(consumer);
        let shutdown = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        let mut topics = Vec::new();
        while topics.last() != Some(&Topic::QueueItemProcessed) {
            topics.push(rx.recv().await.unwrap().topic());
        }
        assert_eq!(topics, vec![Topic::Error, Topic::Error, Topic::QueueItemProcessed]);
        assert_eq!(consumer.stats().lease_failures, 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
