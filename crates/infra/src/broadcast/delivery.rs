//! Per-session delivery loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use datlake_core::ProbeId;
use datlake_events::BroadcastEvent;

use super::broadcaster::Broadcaster;
use super::session::{Session, ZombieReason};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Io(String),
}

/// Where a session's events are written (an SSE response body in production).
#[async_trait]
pub trait SessionTransport: Send {
    async fn write(&mut self, event: &BroadcastEvent) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryExit {
    Shutdown,
    Zombie(ZombieReason),
    /// The session was unsubscribed or its queue closed.
    Removed,
    /// The client went away.
    Disconnected,
}

/// Drive `session`'s outbound queue onto `transport` until the session is
/// closed.
///
/// While idle the loop writes liveness traffic: a probe when the probe
/// cadence is due, otherwise a heartbeat when the heartbeat cadence is due.
/// A closed transport ends the loop at once. Other write errors count
/// toward the write-failure threshold. A session that exits for any reason
/// other than a zombie flag is unsubscribed here; zombies are left for the
/// supervisor to evict.
pub async fn run_delivery<T>(
    broadcaster: Arc<Broadcaster>,
    session: Arc<Session>,
    mut receiver: mpsc::Receiver<Arc<BroadcastEvent>>,
    mut transport: T,
) -> DeliveryExit
where
    T: SessionTransport,
{
    let config = *broadcaster.config();
    let closed = session.closed().clone();

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break closed_exit(&broadcaster, &session),
            next = tokio::time::timeout(config.idle_wait, receiver.recv()) => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break DeliveryExit::Removed,
            Err(_idle) => {
                let now = Instant::now();
                if session.probe_due(now, config.probe_interval) {
                    let probe_id = ProbeId::new();
                    session.record_probe(probe_id);
                    Arc::new(BroadcastEvent::probe(probe_id))
                } else if session.heartbeat_due(now, config.heartbeat_interval) {
                    session.record_heartbeat();
                    Arc::new(BroadcastEvent::heartbeat())
                } else {
                    continue;
                }
            }
        };

        let written = match tokio::time::timeout(config.write_timeout, transport.write(&event)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(config.write_timeout)),
        };

        match written {
            Ok(()) => session.record_send(),
            Err(TransportError::Closed) => break DeliveryExit::Disconnected,
            Err(error) => {
                let failures = session.record_write_failure();
                warn!(session_id = %session.id(), %error, failures, "stream write failed");
                if failures > config.max_write_failures {
                    broadcaster.flag_zombie(session.id(), ZombieReason::WriteFailures);
                    break DeliveryExit::Zombie(ZombieReason::WriteFailures);
                }
            }
        }
    };

    if !matches!(exit, DeliveryExit::Zombie(_)) {
        broadcaster.unsubscribe(session.id());
    }
    debug!(session_id = %session.id(), ?exit, "delivery loop exited");
    exit
}

fn closed_exit(broadcaster: &Broadcaster, session: &Session) -> DeliveryExit {
    if let Some(reason) = session.zombie_reason() {
        DeliveryExit::Zombie(reason)
    } else if broadcaster.shutdown_token().is_cancelled() {
        DeliveryExit::Shutdown
    } else {
        DeliveryExit::Removed
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::Map;

    use datlake_events::{JobStatus, Topic};

    use super::*;
    use crate::broadcast::BroadcastConfig;

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<Topic>>>);

    #[async_trait]
    impl SessionTransport for Recording {
        async fn write(&mut self, event: &BroadcastEvent) -> Result<(), TransportError> {
            self.0.lock().push(event.topic());
            Ok(())
        }
    }

    struct Broken;

    struct HungUp;

    #[async_trait]
    impl SessionTransport for HungUp {
        async fn write(&mut self, _event: &BroadcastEvent) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[async_trait]
    impl SessionTransport for Broken {
        async fn write(&mut self, _event: &BroadcastEvent) -> Result<(), TransportError> {
            Err(TransportError::Io("broken pipe".into()))
        }
    }

    fn job() -> BroadcastEvent {
        BroadcastEvent::job_status(JobStatus {
            job_name: "load".into(),
            run_id: "r1".into(),
            status: "running".into(),
            progress: None,
            metadata: Map::new(),
        })
    }

    #[tokio::test]
    async fn consecutive_write_failures_flag_the_session_and_stop_the_loop() {
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        let sub = broadcaster.subscribe([Topic::JobStatus]);
        let session = sub.session.clone();

        for _ in 0..4 {
            broadcaster.publish(job());
        }

        let exit = run_delivery(broadcaster.clone(), sub.session, sub.receiver, Broken).await;

        assert_eq!(exit, DeliveryExit::Zombie(ZombieReason::WriteFailures));
        assert_eq!(session.zombie_reason(), Some(ZombieReason::WriteFailures));
        // Left in the table for the supervisor's grace period.
        assert!(broadcaster.session(session.id()).is_some());
    }

    #[tokio::test]
    async fn a_hung_up_client_is_removed_without_a_zombie_flag() {
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        let sub = broadcaster.subscribe([Topic::JobStatus]);
        let session = sub.session.clone();
        broadcaster.publish(job());

        let exit = run_delivery(broadcaster.clone(), sub.session, sub.receiver, HungUp).await;

        assert_eq!(exit, DeliveryExit::Disconnected);
        assert!(!session.is_zombie());
        assert!(broadcaster.session(session.id()).is_none());
    }

    #[tokio::test]
    async fn idle_sessions_get_a_probe_then_heartbeats() {
        tokio::time::pause();
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        let sub = broadcaster.subscribe([Topic::JobStatus]);
        let session = sub.session.clone();
        let transport = Recording::default();
        let written = transport.0.clone();

        let handle = tokio::spawn(run_delivery(
            broadcaster.clone(),
            sub.session,
            sub.receiver,
            transport,
        ));

        // idle 30s: first probe; 60s: heartbeat; 90s: probe (45s cadence) again.
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(
            *written.lock(),
            vec![Topic::LivenessProbe, Topic::LivenessHeartbeat, Topic::LivenessProbe]
        );
        assert_eq!(session.snapshot(Instant::now()).probe_count, 2);

        broadcaster.unsubscribe(session.id());
        assert_eq!(handle.await.unwrap(), DeliveryExit::Removed);
    }

    #[tokio::test]
    async fn events_are_written_in_queue_order() {
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        let sub = broadcaster.subscribe([Topic::JobStatus, Topic::Error]);
        let id = sub.id();
        let transport = Recording::default();
        let written = transport.0.clone();

        broadcaster.publish(job());
        broadcaster.publish(BroadcastEvent::error("queue_unavailable", "queue store unreachable"));
        broadcaster.publish(job());

        let handle = tokio::spawn(run_delivery(
            broadcaster.clone(),
            sub.session,
            sub.receiver,
            transport,
        ));
        while written.lock().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *written.lock(),
            vec![Topic::JobStatus, Topic::Error, Topic::JobStatus]
        );

        broadcaster.shutdown_token().cancel();
        assert_eq!(handle.await.unwrap(), DeliveryExit::Shutdown);
        assert!(broadcaster.session(id).is_none());
    }
}
