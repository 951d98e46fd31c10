//! Session table, replay buffer and fan-out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use datlake_core::{ProbeId, SessionId};
use datlake_events::{BroadcastEvent, Topic};
use datlake_observability::metrics::{
    BROADCAST_ACTIVE_SESSIONS, BROADCAST_EVENTS_PUBLISHED, BROADCAST_QUEUE_FULL,
    BROADCAST_ZOMBIE_DETECTIONS,
};

use super::BroadcastConfig;
use super::delivery::{SessionTransport, run_delivery};
use super::replay::ReplayBuffer;
use super::session::{Enqueue, Session, ZombieReason};
use super::stats::{BroadcastStats, ZombieDetection, ZombieReport, ZombieSnapshot};

/// A freshly registered session and the receiving end of its outbound queue.
#[derive(Debug)]
pub struct Subscription {
    pub session: Arc<Session>,
    pub receiver: mpsc::Receiver<Arc<BroadcastEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SessionId {
        self.session.id()
    }
}

/// Per-publish fan-out counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Accepted,
    UnknownSession,
    UnknownProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub zombies_before: usize,
    pub zombies_removed: usize,
}

struct State {
    sessions: HashMap<SessionId, Arc<Session>>,
    replay: ReplayBuffer,
    detection: ZombieDetection,
}

/// Fans events out to every interested session.
///
/// All mutation goes through one mutex that is never held across an await.
/// Lock order is always broadcaster state, then a session's liveness.
pub struct Broadcaster {
    config: BroadcastConfig,
    state: Mutex<State>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl core::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sessions", &self.state.lock().sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self::with_shutdown(config, CancellationToken::new(), TaskTracker::new())
    }

    /// Build a broadcaster whose session tasks hang off an existing shutdown
    /// token and task tracker.
    pub fn with_shutdown(
        config: BroadcastConfig,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                sessions: HashMap::new(),
                replay: ReplayBuffer::new(config.replay_capacity),
                detection: ZombieDetection::default(),
            }),
            shutdown,
            tracker,
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Register a session on `topics` (the default subscription when empty)
    /// and replay recent matching events into its queue.
    pub fn subscribe<I>(&self, topics: I) -> Subscription
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut topics: BTreeSet<Topic> = topics.into_iter().collect();
        if topics.is_empty() {
            topics.extend(Topic::DEFAULT_SUBSCRIPTION);
        }

        let (session, receiver) = Session::new(topics, &self.config, &self.shutdown);

        let (replayed, active) = {
            let mut state = self.state.lock();
            let backlog = state
                .replay
                .recent(session.topics(), self.config.replay_window);
            let replayed = session.preload(backlog);
            state.sessions.insert(session.id(), session.clone());
            (replayed, state.sessions.len())
        };
        gauge!(BROADCAST_ACTIVE_SESSIONS).set(active as f64);

        info!(
            session_id = %session.id(),
            topics = ?session.topics(),
            replayed,
            active,
            "stream session subscribed"
        );

        Subscription { session, receiver }
    }

    /// Remove a session. Safe to call for unknown or already removed ids.
    pub fn unsubscribe(&self, id: SessionId) -> bool {
        self.remove(id, None)
    }

    fn remove(&self, id: SessionId, reason: Option<ZombieReason>) -> bool {
        let (removed, active) = {
            let mut state = self.state.lock();
            let removed = state.sessions.remove(&id);
            (removed, state.sessions.len())
        };
        let Some(session) = removed else {
            return false;
        };

        session.close();
        gauge!(BROADCAST_ACTIVE_SESSIONS).set(active as f64);
        match reason {
            Some(reason) => warn!(session_id = %id, %reason, active, "zombie session evicted"),
            None => info!(session_id = %id, active, "stream session removed"),
        }
        true
    }

    /// Record `event` for replay and offer it to every matching live session.
    pub fn publish(&self, event: BroadcastEvent) -> PublishReport {
        self.fan_out(event, None)
    }

    /// Like [`Broadcaster::publish`], but only sessions in `targets` are
    /// offered the event. Unknown ids are ignored; topic and zombie filters
    /// still apply.
    pub fn publish_to(&self, event: BroadcastEvent, targets: &[SessionId]) -> PublishReport {
        let targets: HashSet<SessionId> = targets.iter().copied().collect();
        self.fan_out(event, Some(&targets))
    }

    fn fan_out(
        &self,
        event: BroadcastEvent,
        targets: Option<&HashSet<SessionId>>,
    ) -> PublishReport {
        let event = Arc::new(event);
        let topic = event.topic();
        let mut report = PublishReport::default();

        let active = {
            let mut state = self.state.lock();
            if !topic.is_liveness() {
                state.replay.push(event.clone());
            }

            let mut closed = Vec::new();
            let mut overflowing = Vec::new();
            for session in state.sessions.values() {
                if targets.is_some_and(|t| !t.contains(&session.id())) {
                    continue;
                }
                if !session.is_subscribed(topic) || session.is_zombie() {
                    continue;
                }
                match session.try_enqueue(event.clone()) {
                    Enqueue::Delivered => report.delivered += 1,
                    Enqueue::Full(count) => {
                        report.dropped += 1;
                        counter!(BROADCAST_QUEUE_FULL).increment(1);
                        debug!(session_id = %session.id(), %topic, count, "session queue full; event dropped");
                        if count > self.config.max_queue_full_events {
                            overflowing.push(session.clone());
                        }
                    }
                    Enqueue::Closed => closed.push(session.id()),
                }
            }

            for session in overflowing {
                Self::flag(&mut state.detection, &session, ZombieReason::QueueFull);
            }
            for id in closed {
                if let Some(session) = state.sessions.remove(&id) {
                    session.close();
                    report.removed += 1;
                }
            }
            state.sessions.len()
        };

        if report.removed > 0 {
            gauge!(BROADCAST_ACTIVE_SESSIONS).set(active as f64);
            debug!(removed = report.removed, "removed sessions with closed queues");
        }
        counter!(BROADCAST_EVENTS_PUBLISHED, "topic" => topic.as_str()).increment(1);

        report
    }

    pub fn acknowledge_probe(&self, id: SessionId, probe_id: ProbeId) -> AckOutcome {
        let Some(session) = self.session(id) else {
            return AckOutcome::UnknownSession;
        };
        if session.acknowledge(probe_id) {
            debug!(session_id = %id, %probe_id, "probe acknowledged");
            AckOutcome::Accepted
        } else {
            AckOutcome::UnknownProbe
        }
    }

    /// Flag a session as a zombie. It stops receiving publishes immediately
    /// and is evicted by the supervisor once its grace period has elapsed.
    pub fn flag_zombie(&self, id: SessionId, reason: ZombieReason) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get(&id).cloned() else {
            return false;
        };
        Self::flag(&mut state.detection, &session, reason)
    }

    fn flag(detection: &mut ZombieDetection, session: &Session, reason: ZombieReason) -> bool {
        if !session.mark_zombie(reason) {
            return false;
        }
        detection.record(reason);
        counter!(BROADCAST_ZOMBIE_DETECTIONS, "reason" => reason.as_str()).increment(1);
        warn!(session_id = %session.id(), %reason, "session flagged as zombie");
        true
    }

    /// Remove a session as part of zombie eviction.
    pub(crate) fn evict(&self, id: SessionId, reason: ZombieReason) -> bool {
        self.remove(id, Some(reason))
    }

    pub(crate) fn record_health_check(&self) {
        self.state.lock().detection.last_health_check = Some(Utc::now());
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.state.lock().sessions.get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().sessions.values().cloned().collect()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.state.lock().sessions.keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        let now = Instant::now();
        let (sessions, replay_buffer_size, zombie_detection) = {
            let state = self.state.lock();
            (
                state.sessions.values().cloned().collect::<Vec<_>>(),
                state.replay.len(),
                state.detection.clone(),
            )
        };

        let mut snapshots: Vec<_> = sessions.iter().map(|s| s.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        let zombie_sessions = snapshots.iter().filter(|s| s.zombie).count();

        BroadcastStats {
            connected_sessions: snapshots.len(),
            healthy_sessions: snapshots.len() - zombie_sessions,
            zombie_sessions,
            replay_buffer_size,
            zombie_detection,
            sessions: snapshots,
        }
    }

    pub fn zombie_report(&self) -> ZombieReport {
        let stats = self.stats();
        let zombies: Vec<ZombieSnapshot> = stats
            .sessions
            .iter()
            .filter(|s| s.zombie)
            .map(ZombieSnapshot::from)
            .collect();

        ZombieReport {
            current_zombies: zombies.len(),
            total_detected: stats.zombie_detection.total_detected,
            detection_reasons: stats.zombie_detection.detection_reasons,
            last_health_check: stats.zombie_detection.last_health_check,
            zombies,
        }
    }

    /// Evict every zombie now, ignoring the grace period.
    pub fn cleanup_zombies(&self) -> CleanupReport {
        let zombies: Vec<_> = self
            .sessions()
            .into_iter()
            .filter_map(|s| s.zombie_reason().map(|r| (s.id(), r)))
            .collect();

        let zombies_removed = zombies
            .iter()
            .filter(|(id, reason)| self.evict(*id, *reason))
            .count();

        info!(zombies_before = zombies.len(), zombies_removed, "zombie cleanup completed");
        CleanupReport {
            zombies_before: zombies.len(),
            zombies_removed,
        }
    }

    /// Run the delivery loop for `subscription` on the shared task tracker.
    pub fn spawn_delivery<T>(self: &Arc<Self>, subscription: Subscription, transport: T)
    where
        T: SessionTransport + 'static,
    {
        let broadcaster = self.clone();
        self.tracker.spawn(async move {
            let Subscription { session, receiver } = subscription;
            let exit = run_delivery(broadcaster, session.clone(), receiver, transport).await;
            debug!(session_id = %session.id(), ?exit, "delivery loop finished");
        });
    }
}
