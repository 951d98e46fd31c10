//! Work queue store abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use datlake_core::MessageId;

/// A leased queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub message_id: MessageId,
    pub payload: JsonValue,
    /// How many times the store has handed this message out (1 on first lease).
    pub read_count: u32,
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    /// The store could not be reached (transient; callers retry).
    #[error("queue store unavailable: {0}")]
    Unavailable(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable, at-least-once queue store addressed by queue name.
///
/// Leased items become invisible for the visibility window and reappear if
/// not deleted before it expires. Implementations must be safe to share
/// between the consumer, the notification relay and the depth reporter.
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Lease up to `max_items`, waiting up to `wait` when none are visible.
    async fn lease(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Delete a message. Returns `false` when it was already gone.
    async fn delete(&self, queue: &str, message_id: MessageId) -> Result<bool, QueueStoreError>;

    /// Append a message and return its id.
    async fn send(&self, queue: &str, payload: JsonValue) -> Result<MessageId, QueueStoreError>;

    /// Append `payload` to `dead_letter_queue` and delete `message_id` from
    /// `queue` as one atomic step.
    ///
    /// Returns the dead-letter id, or `None` when the source message was
    /// already gone (nothing is written then).
    async fn dead_letter(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        message_id: MessageId,
        payload: JsonValue,
    ) -> Result<Option<MessageId>, QueueStoreError>;

    /// Number of messages held by the queue, leased or not.
    async fn length(&self, queue: &str) -> Result<u64, QueueStoreError>;
}

#[async_trait]
impl<S> WorkQueueStore for Arc<S>
where
    S: WorkQueueStore + ?Sized,
{
    async fn lease(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).lease(queue, max_items, visibility, wait).await
    }

    async fn delete(&self, queue: &str, message_id: MessageId) -> Result<bool, QueueStoreError> {
        (**self).delete(queue, message_id).await
    }

    async fn send(&self, queue: &str, payload: JsonValue) -> Result<MessageId, QueueStoreError> {
        (**self).send(queue, payload).await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        message_id: MessageId,
        payload: JsonValue,
    ) -> Result<Option<MessageId>, QueueStoreError> {
        (**self)
            .dead_letter(queue, dead_letter_queue, message_id, payload)
            .await
    }

    async fn length(&self, queue: &str) -> Result<u64, QueueStoreError> {
        (**self).length(queue).await
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: JsonValue,
    visible_at: Instant,
    read_count: u32,
}

type Queues = HashMap<String, BTreeMap<MessageId, StoredMessage>>;

/// In-memory queue store for tests/dev.
///
/// Honours visibility windows (leased items reappear after expiry) and can
/// be told to fail leases, sends or deletes to simulate an unreachable
/// store. A dead-letter move fails when either its send or its delete is
/// set to fail, and then changes nothing.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    queues: Mutex<Queues>,
    next_id: AtomicI64,
    failing_leases: AtomicUsize,
    failing_sends: AtomicUsize,
    failing_deletes: AtomicUsize,
    arrivals: Notify,
}

/// Longest lease a message can be hidden for.
const MAX_VISIBILITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` lease calls fail with `Unavailable`.
    pub fn fail_next_leases(&self, count: usize) {
        self.failing_leases.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` sends (including dead-letter writes) fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` deletes (including dead-letter moves) fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every message in a queue (visible or leased), in id order.
    pub fn messages(&self, queue: &str) -> Vec<(MessageId, JsonValue)> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().map(|(id, m)| (*id, m.payload.clone())).collect())
            .unwrap_or_default()
    }

    /// Make every leased message in `queue` visible again, as if its
    /// visibility window had expired (simulates a consumer crash).
    pub fn expire_leases(&self, queue: &str) {
        let now = Instant::now();
        if let Some(q) = self.queues.lock().get_mut(queue) {
            for msg in q.values_mut() {
                msg.visible_at = now;
            }
        }
        self.arrivals.notify_waiters();
    }

    fn take_visible(&self, queue: &str, max_items: usize, visibility: Duration) -> Vec<QueueItem> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(q) = queues.get_mut(queue) else {
            return Vec::new();
        };

        q.iter_mut()
            .filter(|(_, m)| m.visible_at <= now)
            .take(max_items)
            .map(|(id, m)| {
                m.visible_at = now + visibility.min(MAX_VISIBILITY);
                m.read_count += 1;
                QueueItem {
                    message_id: *id,
                    payload: m.payload.clone(),
                    read_count: m.read_count,
                }
            })
            .collect()
    }

    fn next_visible_at(&self, queue: &str) -> Option<Instant> {
        self.queues
            .lock()
            .get(queue)
            .and_then(|q| q.values().map(|m| m.visible_at).min())
    }

    fn insert(queues: &mut Queues, queue: &str, id: MessageId, payload: JsonValue) {
        queues.entry(queue.to_string()).or_default().insert(
            id,
            StoredMessage {
                payload,
                visible_at: Instant::now(),
                read_count: 0,
            },
        );
    }

    fn next_id(&self) -> MessageId {
        MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn simulated(operation: &str) -> QueueStoreError {
    QueueStoreError::Unavailable(format!("simulated outage during {operation}"))
}

#[async_trait]
impl WorkQueueStore for InMemoryQueueStore {
    async fn lease(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        if take_failure(&self.failing_leases) {
            return Err(simulated("lease"));
        }

        let deadline = Instant::now() + wait.min(MAX_VISIBILITY);

        loop {
            // Register interest before checking so a send between the check
            // and the wait is not missed.
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let items = self.take_visible(queue, max_items, visibility);
            if !items.is_empty() {
                return Ok(items);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = self
                .next_visible_at(queue)
                .filter(|at| *at > now)
                .map_or(deadline, |at| at.min(deadline));

            let _ = tokio::time::timeout_at(wake_at, arrived).await;
        }
    }

    async fn delete(&self, queue: &str, message_id: MessageId) -> Result<bool, QueueStoreError> {
        if take_failure(&self.failing_deletes) {
            return Err(simulated("delete"));
        }
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(|q| q.remove(&message_id))
            .is_some())
    }

    async fn send(&self, queue: &str, payload: JsonValue) -> Result<MessageId, QueueStoreError> {
        if take_failure(&self.failing_sends) {
            return Err(simulated("send"));
        }
        let id = self.next_id();
        Self::insert(&mut self.queues.lock(), queue, id, payload);
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        message_id: MessageId,
        payload: JsonValue,
    ) -> Result<Option<MessageId>, QueueStoreError> {
        if take_failure(&self.failing_sends) {
            return Err(simulated("dead-letter send"));
        }
        if take_failure(&self.failing_deletes) {
            return Err(simulated("dead-letter delete"));
        }

        let mut queues = self.queues.lock();
        let removed = queues.get_mut(queue).and_then(|q| q.remove(&message_id));
        if removed.is_none() {
            return Ok(None);
        }
        let id = self.next_id();
        Self::insert(&mut queues, dead_letter_queue, id, payload);
        drop(queues);

        self.arrivals.notify_waiters();
        Ok(Some(id))
    }

    async fn length(&self, queue: &str) -> Result<u64, QueueStoreError> {
        Ok(self.queues.lock().get(queue).map_or(0, |q| q.len() as u64))
    }
}
