//! Durable work queue consumption.
//!
//! The consumer leases lineage events, runs them through an
//! [`EventProcessor`] and publishes every outcome to the broadcaster.
//! Failed items are moved to the dead-letter queue.

use std::time::Duration;

pub mod consumer;
pub mod dead_letter;
pub mod depth;
pub mod notifications;
pub mod pgmq;
pub mod processor;
pub mod store;

pub use consumer::{ConsumerState, ConsumerStats, QueueConsumer};
pub use dead_letter::DeadLetterRecord;
pub use depth::QueueDepthReporter;
pub use notifications::NotificationRelay;
pub use pgmq::PgmqQueueStore;
pub use processor::{EventProcessor, LoggingProcessor, ProcessorError};
pub use store::{InMemoryQueueStore, QueueItem, QueueStoreError, WorkQueueStore};

/// Queue names and consumer cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub queue_name: String,
    pub dead_letter_queue: String,
    pub notification_queue: String,
    pub batch_size: usize,
    /// Longest a lease call blocks waiting for work.
    pub poll_interval: Duration,
    /// How long a leased item stays invisible before redelivery.
    pub visibility_window: Duration,
    /// Sleep after a failed lease before retrying.
    pub error_backoff: Duration,
    pub notification_poll_interval: Duration,
    pub depth_report_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_name: "lineage_events".to_string(),
            dead_letter_queue: "lineage_events_dlq".to_string(),
            notification_queue: "lineage_notifications".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            visibility_window: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            notification_poll_interval: Duration::from_secs(1),
            depth_report_interval: Duration::from_secs(30),
        }
    }
}
