//! One connected stream subscriber and its liveness bookkeeping.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use datlake_core::{ProbeId, SessionId};
use datlake_events::{BroadcastEvent, Topic};

use super::BroadcastConfig;

/// Why a session was declared a zombie.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZombieReason {
    /// Nothing written within the hard timeout.
    Timeout,
    MissedProbes,
    QueueFull,
    WriteFailures,
    /// Probes were sent but none was ever acknowledged.
    NoProbeAck,
}

impl ZombieReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZombieReason::Timeout => "timeout",
            ZombieReason::MissedProbes => "missed_probes",
            ZombieReason::QueueFull => "queue_full",
            ZombieReason::WriteFailures => "write_failures",
            ZombieReason::NoProbeAck => "no_probe_ack",
        }
    }
}

impl core::fmt::Display for ZombieReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of offering an event to a session's outbound queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Enqueue {
    Delivered,
    /// Queue full; carries the consecutive full count.
    Full(u32),
    /// The delivery loop is gone.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct ZombieMark {
    reason: ZombieReason,
    detected_at: Instant,
    detected_at_wall: DateTime<Utc>,
}

#[derive(Debug)]
struct Liveness {
    last_send: Instant,
    last_probe_sent: Option<Instant>,
    last_probe_ack: Option<Instant>,
    probe_count: u64,
    heartbeat_count: u64,
    missed_probes: u32,
    queue_full_events: u32,
    write_failures: u32,
    outstanding_probes: VecDeque<ProbeId>,
    zombie: Option<ZombieMark>,
}

/// A connected subscriber.
///
/// The broadcaster is the only writer of the outbound queue and the
/// session's delivery loop its only reader. `closed` fires when the session
/// is removed, flagged zombie, or the process shuts down.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    topics: BTreeSet<Topic>,
    connected_at: Instant,
    connected_at_wall: DateTime<Utc>,
    outbound: mpsc::Sender<Arc<BroadcastEvent>>,
    closed: CancellationToken,
    max_outstanding_probes: usize,
    liveness: Mutex<Liveness>,
}

impl Session {
    pub(crate) fn new(
        topics: BTreeSet<Topic>,
        config: &BroadcastConfig,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<BroadcastEvent>>) {
        let (outbound, receiver) = mpsc::channel(config.session_queue_capacity.max(1));
        let now = Instant::now();
        let session = Arc::new(Self {
            id: SessionId::new(),
            topics,
            connected_at: now,
            connected_at_wall: Utc::now(),
            outbound,
            closed: parent.child_token(),
            max_outstanding_probes: config.max_outstanding_probes.max(1),
            liveness: Mutex::new(Liveness {
                last_send: now,
                last_probe_sent: None,
                last_probe_ack: None,
                probe_count: 0,
                heartbeat_count: 0,
                missed_probes: 0,
                queue_full_events: 0,
                write_failures: 0,
                outstanding_probes: VecDeque::new(),
                zombie: None,
            }),
        });
        (session, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn topics(&self) -> &BTreeSet<Topic> {
        &self.topics
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.topics.contains(&topic)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Fires once the session should stop delivering.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Offer an event to the outbound queue without waiting.
    pub(crate) fn try_enqueue(&self, event: Arc<BroadcastEvent>) -> Enqueue {
        match self.outbound.try_send(event) {
            Ok(()) => {
                self.liveness.lock().queue_full_events = 0;
                Enqueue::Delivered
            }
            Err(TrySendError::Full(_)) => {
                let mut live = self.liveness.lock();
                live.queue_full_events += 1;
                Enqueue::Full(live.queue_full_events)
            }
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Replay buffered events into a fresh queue; stops at the first one
    /// that does not fit. Returns how many were queued.
    pub(crate) fn preload(&self, events: Vec<Arc<BroadcastEvent>>) -> usize {
        let mut queued = 0;
        for event in events {
            if self.outbound.try_send(event).is_err() {
                break;
            }
            queued += 1;
        }
        queued
    }

    /// Flag the session as a zombie. Returns `true` the first time only.
    pub(crate) fn mark_zombie(&self, reason: ZombieReason) -> bool {
        let first = {
            let mut live = self.liveness.lock();
            if live.zombie.is_some() {
                false
            } else {
                live.zombie = Some(ZombieMark {
                    reason,
                    detected_at: Instant::now(),
                    detected_at_wall: Utc::now(),
                });
                true
            }
        };
        if first {
            self.closed.cancel();
        }
        first
    }

    pub fn is_zombie(&self) -> bool {
        self.liveness.lock().zombie.is_some()
    }

    pub fn zombie_reason(&self) -> Option<ZombieReason> {
        self.liveness.lock().zombie.map(|z| z.reason)
    }

    /// True once the session has been a zombie for at least `grace`.
    pub fn grace_elapsed(&self, now: Instant, grace: std::time::Duration) -> bool {
        self.liveness
            .lock()
            .zombie
            .is_some_and(|z| now.saturating_duration_since(z.detected_at) >= grace)
    }

    pub(crate) fn record_send(&self) {
        let mut live = self.liveness.lock();
        live.last_send = Instant::now();
        live.write_failures = 0;
    }

    /// Returns the consecutive failure count.
    pub(crate) fn record_write_failure(&self) -> u32 {
        let mut live = self.liveness.lock();
        live.write_failures += 1;
        live.write_failures
    }

    pub(crate) fn record_probe(&self, probe_id: ProbeId) {
        let mut live = self.liveness.lock();
        live.last_probe_sent = Some(Instant::now());
        live.probe_count += 1;
        live.missed_probes += 1;
        live.outstanding_probes.push_back(probe_id);
        while live.outstanding_probes.len() > self.max_outstanding_probes {
            live.outstanding_probes.pop_front();
        }
    }

    pub(crate) fn record_heartbeat(&self) {
        self.liveness.lock().heartbeat_count += 1;
    }

    /// Accept an ack for an outstanding probe.
    pub(crate) fn acknowledge(&self, probe_id: ProbeId) -> bool {
        let mut live = self.liveness.lock();
        let Some(pos) = live.outstanding_probes.iter().position(|p| *p == probe_id) else {
            return false;
        };
        // Acking a probe implicitly acks every older one.
        live.outstanding_probes.drain(..=pos);
        live.missed_probes = 0;
        live.last_probe_ack = Some(Instant::now());
        true
    }

    pub(crate) fn probe_due(&self, now: Instant, interval: std::time::Duration) -> bool {
        self.liveness
            .lock()
            .last_probe_sent
            .is_none_or(|at| now.saturating_duration_since(at) >= interval)
    }

    pub(crate) fn heartbeat_due(&self, now: Instant, interval: std::time::Duration) -> bool {
        now.saturating_duration_since(self.liveness.lock().last_send) >= interval
    }

    /// Time since the last successful write.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.liveness.lock().last_send)
    }

    /// Health verdict for a non-zombie session, first failing check wins.
    pub fn evaluate_health(&self, now: Instant, config: &BroadcastConfig) -> Option<ZombieReason> {
        let live = self.liveness.lock();
        if live.zombie.is_some() {
            return None;
        }
        if live.missed_probes > config.max_missed_probes {
            return Some(ZombieReason::MissedProbes);
        }
        if live.queue_full_events > config.max_queue_full_events {
            return Some(ZombieReason::QueueFull);
        }
        if live.write_failures > config.max_write_failures {
            return Some(ZombieReason::WriteFailures);
        }
        if live.probe_count > 0
            && live.last_probe_ack.is_none()
            && now.saturating_duration_since(self.connected_at) > config.max_probe_ack_wait
        {
            return Some(ZombieReason::NoProbeAck);
        }
        None
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let live = self.liveness.lock();
        let secs_since = |at: Instant| now.saturating_duration_since(at).as_secs_f64();
        SessionSnapshot {
            session_id: self.id,
            topics: self.topics.iter().copied().collect(),
            connected_at: self.connected_at_wall,
            connected_secs: secs_since(self.connected_at),
            idle_secs: secs_since(live.last_send),
            queued: self.outbound.max_capacity() - self.outbound.capacity(),
            probe_count: live.probe_count,
            heartbeat_count: live.heartbeat_count,
            missed_probes: live.missed_probes,
            queue_full_events: live.queue_full_events,
            write_failures: live.write_failures,
            last_probe_secs_ago: live.last_probe_sent.map(secs_since),
            last_ack_secs_ago: live.last_probe_ack.map(secs_since),
            zombie: live.zombie.is_some(),
            zombie_reason: live.zombie.map(|z| z.reason),
            zombie_detected_at: live.zombie.map(|z| z.detected_at_wall),
            zombie_secs: live.zombie.map(|z| secs_since(z.detected_at)),
        }
    }
}

/// Point-in-time view of a session for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub topics: Vec<Topic>,
    pub connected_at: DateTime<Utc>,
    pub connected_secs: f64,
    pub idle_secs: f64,
    pub queued: usize,
    pub probe_count: u64,
    pub heartbeat_count: u64,
    pub missed_probes: u32,
    pub queue_full_events: u32,
    pub write_failures: u32,
    pub last_probe_secs_ago: Option<f64>,
    pub last_ack_secs_ago: Option<f64>,
    pub zombie: bool,
    pub zombie_reason: Option<ZombieReason>,
    pub zombie_detected_at: Option<DateTime<Utc>>,
    pub zombie_secs: Option<f64>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn session(capacity: usize) -> (Arc<Session>, mpsc::Receiver<Arc<BroadcastEvent>>) {
        let config = BroadcastConfig {
            session_queue_capacity: capacity,
            max_outstanding_probes: 2,
            ..BroadcastConfig::default()
        };
        Session::new(BTreeSet::from([Topic::JobStatus]), &config, &CancellationToken::new())
    }

    #[tokio::test]
    async fn full_queue_counts_until_a_delivery_succeeds() {
        let (s, mut rx) = session(1);
        assert_eq!(s.try_enqueue(Arc::new(BroadcastEvent::heartbeat())), Enqueue::Delivered);
        assert_eq!(s.try_enqueue(Arc::new(BroadcastEvent::heartbeat())), Enqueue::Full(1));
        assert_eq!(s.try_enqueue(Arc::new(BroadcastEvent::heartbeat())), Enqueue::Full(2));

        rx.recv().await.unwrap();
        assert_eq!(s.try_enqueue(Arc::new(BroadcastEvent::heartbeat())), Enqueue::Delivered);
        assert_eq!(s.snapshot(Instant::now()).queue_full_events, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (s, rx) = session(4);
        drop(rx);
        assert_eq!(s.try_enqueue(Arc::new(BroadcastEvent::heartbeat())), Enqueue::Closed);
    }

    #[tokio::test]
    async fn zombie_flag_is_set_once_and_closes_the_session() {
        let (s, _rx) = session(4);
        assert!(s.mark_zombie(ZombieReason::QueueFull));
        assert!(!s.mark_zombie(ZombieReason::Timeout));
        assert_eq!(s.zombie_reason(), Some(ZombieReason::QueueFull));
        assert!(s.closed().is_cancelled());
    }

    #[tokio::test]
    async fn ack_must_match_an_outstanding_probe() {
        let (s, _rx) = session(4);
        let first = ProbeId::new();
        let second = ProbeId::new();
        s.record_probe(first);
        s.record_probe(second);
        assert_eq!(s.snapshot(Instant::now()).missed_probes, 2);

        assert!(!s.acknowledge(ProbeId::new()));
        assert!(s.acknowledge(second));
        assert_eq!(s.snapshot(Instant::now()).missed_probes, 0);
        // Older probe was implicitly acknowledged.
        assert!(!s.acknowledge(first));
    }

    #[tokio::test]
    async fn outstanding_probes_are_bounded() {
        let (s, _rx) = session(4);
        let oldest = ProbeId::new();
        s.record_probe(oldest);
        s.record_probe(ProbeId::new());
        s.record_probe(ProbeId::new());
        assert!(!s.acknowledge(oldest));
    }

    #[tokio::test]
    async fn health_checks_use_strict_thresholds() {
        tokio::time::pause();
        let config = BroadcastConfig::default();
        let (s, _rx) = session(4);

        for _ in 0..3 {
            s.record_probe(ProbeId::new());
        }
        // Three missed probes is still healthy; connect age below the ack wait.
        assert_eq!(s.evaluate_health(Instant::now(), &config), None);

        s.record_probe(ProbeId::new());
        assert_eq!(
            s.evaluate_health(Instant::now(), &config),
            Some(ZombieReason::MissedProbes)
        );
    }

    #[tokio::test]
    async fn unacknowledged_probes_flag_after_the_ack_wait() {
        tokio::time::pause();
        let config = BroadcastConfig::default();
        let (s, _rx) = session(4);
        s.record_probe(ProbeId::new());

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(s.evaluate_health(Instant::now(), &config), None);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            s.evaluate_health(Instant::now(), &config),
            Some(ZombieReason::NoProbeAck)
        );
    }

    #[tokio::test]
    async fn cadences_are_independent() {
        tokio::time::pause();
        let (s, _rx) = session(4);
        let probe = Duration::from_secs(45);
        let heartbeat = Duration::from_secs(30);

        assert!(s.probe_due(Instant::now(), probe));
        assert!(!s.heartbeat_due(Instant::now(), heartbeat));

        s.record_probe(ProbeId::new());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!s.probe_due(Instant::now(), probe));
        assert!(s.heartbeat_due(Instant::now(), heartbeat));

        s.record_send();
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(s.probe_due(Instant::now(), probe));
        assert!(!s.heartbeat_due(Instant::now(), heartbeat));
    }
}
