//! Metric names and the Prometheus recorder.
//!
//! Call sites record through the `metrics` facade macros; the recorder is
//! installed once per process and rendered by the `/metrics` endpoint.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Items taken off the source queue, labelled by `event_type` and `status`.
pub const QUEUE_ITEMS_PROCESSED: &str = "queue_items_processed_total";

/// Time spent in the event processor per item.
pub const QUEUE_PROCESSING_DURATION: &str = "queue_item_processing_duration_seconds";

/// Items moved to the dead-letter queue.
pub const QUEUE_DEAD_LETTERED: &str = "queue_dead_letter_total";

/// Failed lease calls against the queue store.
pub const QUEUE_LEASE_FAILURES: &str = "queue_lease_failures_total";

/// Current queue length, labelled by `queue`.
pub const QUEUE_DEPTH: &str = "queue_depth";

/// Sessions currently in the session table.
pub const BROADCAST_ACTIVE_SESSIONS: &str = "broadcast_active_sessions";

/// Zombie detections, labelled by `reason`.
pub const BROADCAST_ZOMBIE_DETECTIONS: &str = "broadcast_zombie_detections_total";

/// Events dropped because a session's outbound queue was full.
pub const BROADCAST_QUEUE_FULL: &str = "broadcast_queue_full_total";

/// Events published, labelled by `topic`.
pub const BROADCAST_EVENTS_PUBLISHED: &str = "broadcast_events_published_total";

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder and describe every metric.
///
/// Safe to call multiple times; subsequent calls return the same handle.
/// Returns `None` when another recorder was already installed (e.g. by a
/// test harness); recording then goes to that recorder.
pub fn init_metrics() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe();
                tracing::info!("prometheus metrics recorder initialized");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "prometheus recorder not installed");
                None
            }
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned().flatten()
}

fn describe() {
    describe_counter!(QUEUE_ITEMS_PROCESSED, "Queue items processed by outcome");
    describe_histogram!(
        QUEUE_PROCESSING_DURATION,
        "Time spent processing one queue item in seconds"
    );
    describe_counter!(QUEUE_DEAD_LETTERED, "Queue items moved to the dead-letter queue");
    describe_counter!(QUEUE_LEASE_FAILURES, "Failed lease calls against the queue store");
    describe_gauge!(QUEUE_DEPTH, "Messages currently held by a queue");
    describe_gauge!(BROADCAST_ACTIVE_SESSIONS, "Connected stream sessions");
    describe_counter!(BROADCAST_ZOMBIE_DETECTIONS, "Sessions flagged zombie by reason");
    describe_counter!(
        BROADCAST_QUEUE_FULL,
        "Events dropped because a session queue was full"
    );
    describe_counter!(BROADCAST_EVENTS_PUBLISHED, "Events published by topic");
}
