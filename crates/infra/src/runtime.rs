//! Wiring of the long-running tasks behind one shutdown signal.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::broadcast::{Broadcaster, EventPublisher, run_pump, supervisor};
use crate::config::Settings;
use crate::queue::{
    ConsumerState, ConsumerStats, EventProcessor, NotificationRelay, QueueConsumer,
    QueueDepthReporter, WorkQueueStore,
};

/// Running queue consumer, relays and broadcaster.
///
/// Every task (including session delivery loops spawned through the
/// broadcaster) is tracked, so [`CoreRuntime::shutdown`] returns only once
/// all of them have finished. The event producers (consumer, relay, depth
/// reporter) stop first; the pump keeps running until they have, so
/// outcomes of a batch finished during shutdown still reach the broadcaster.
pub struct CoreRuntime {
    broadcaster: Arc<Broadcaster>,
    publisher: EventPublisher,
    consumer_state: watch::Receiver<ConsumerState>,
    consumer_stats: Arc<Mutex<ConsumerStats>>,
    shutdown: CancellationToken,
    pump_shutdown: CancellationToken,
    producers: TaskTracker,
    tracker: TaskTracker,
}

impl CoreRuntime {
    /// Spawn every background task. Must be called inside a Tokio runtime.
    pub fn start<S, P>(settings: &Settings, store: Arc<S>, processor: P) -> Self
    where
        S: WorkQueueStore + ?Sized + 'static,
        P: EventProcessor + 'static,
    {
        let shutdown = CancellationToken::new();
        let pump_shutdown = CancellationToken::new();
        let producers = TaskTracker::new();
        let tracker = TaskTracker::new();

        let broadcaster = Arc::new(Broadcaster::with_shutdown(
            settings.stream,
            shutdown.clone(),
            tracker.clone(),
        ));
        let (publisher, inbound) = EventPublisher::channel(settings.stream.publish_channel_capacity);

        tracker.spawn(run_pump(broadcaster.clone(), inbound, pump_shutdown.clone()));
        tracker.spawn(supervisor::run_timeout_sweep(
            broadcaster.clone(),
            shutdown.clone(),
        ));
        tracker.spawn(supervisor::run_health_checks(
            broadcaster.clone(),
            shutdown.clone(),
        ));

        let queue = &settings.queue;
        let consumer = QueueConsumer::new(store.clone(), processor, publisher.clone(), queue.clone());
        let consumer_state = consumer.state();
        let consumer_stats = consumer.stats_handle();
        {
            let token = shutdown.clone();
            producers.spawn(async move { consumer.run(token).await });
        }

        let relay = NotificationRelay::new(
            store.clone(),
            publisher.clone(),
            queue.notification_queue.clone(),
            queue.notification_poll_interval,
        )
        .with_error_backoff(queue.error_backoff);
        {
            let token = shutdown.clone();
            producers.spawn(async move { relay.run(token).await });
        }

        let reporter = QueueDepthReporter::new(
            store,
            publisher.clone(),
            vec![
                queue.queue_name.clone(),
                queue.dead_letter_queue.clone(),
                queue.notification_queue.clone(),
            ],
            queue.depth_report_interval,
        );
        {
            let token = shutdown.clone();
            producers.spawn(async move { reporter.run(token).await });
        }

        info!(queue = %queue.queue_name, "core runtime started");

        Self {
            broadcaster,
            publisher,
            consumer_state,
            consumer_stats,
            shutdown,
            pump_shutdown,
            producers,
            tracker,
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        *self.consumer_state.borrow()
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumer_stats.lock().clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for every tracked task to finish.
    pub async fn shutdown(&self) {
        info!("core runtime shutting down");
        self.shutdown.cancel();
        self.producers.close();
        self.producers.wait().await;

        self.pump_shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("core runtime stopped");
    }
}
