//! Realtime fan-out of broadcast events to stream subscribers.
//!
//! - [`Broadcaster`] owns the session table and the replay buffer
//! - [`EventPublisher`] is the message-passing handle producers publish through
//! - [`run_delivery`] drives one session's outbound queue onto its transport
//! - [`supervisor`] flags and evicts zombie sessions

use std::time::Duration;

pub mod broadcaster;
pub mod delivery;
pub mod publisher;
pub mod replay;
pub mod session;
pub mod stats;
pub mod supervisor;

pub use broadcaster::{AckOutcome, Broadcaster, CleanupReport, PublishReport, Subscription};
pub use delivery::{DeliveryExit, SessionTransport, TransportError, run_delivery};
pub use publisher::{EventPublisher, run_pump};
pub use replay::ReplayBuffer;
pub use session::{Enqueue, Session, SessionSnapshot, ZombieReason};
pub use stats::{BroadcastStats, ZombieDetection, ZombieReport, ZombieSnapshot};

/// Broadcaster and liveness tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Bounded outbound queue per session.
    pub session_queue_capacity: usize,
    /// Events kept for replay on reconnect.
    pub replay_capacity: usize,
    /// How many buffered events a new session is replayed.
    pub replay_window: usize,
    /// How long a delivery loop waits on its queue before sending liveness traffic.
    pub idle_wait: Duration,
    pub heartbeat_interval: Duration,
    pub probe_interval: Duration,
    /// Probe ids remembered per session for ack matching.
    pub max_outstanding_probes: usize,
    /// A session with nothing written for this long is evicted.
    pub hard_timeout: Duration,
    pub timeout_sweep_interval: Duration,
    pub health_check_interval: Duration,
    /// Time a zombie stays in the session table before eviction.
    pub zombie_grace: Duration,
    pub max_missed_probes: u32,
    pub max_queue_full_events: u32,
    pub max_write_failures: u32,
    /// Probes sent but never acknowledged for this long since connect flag the session.
    pub max_probe_ack_wait: Duration,
    /// Upper bound on a single transport write.
    pub write_timeout: Duration,
    /// Capacity of the producer → broadcaster channel.
    pub publish_channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: 100,
            replay_capacity: 1000,
            replay_window: 50,
            idle_wait: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(45),
            max_outstanding_probes: 16,
            hard_timeout: Duration::from_secs(120),
            timeout_sweep_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            zombie_grace: Duration::from_secs(60),
            max_missed_probes: 3,
            max_queue_full_events: 10,
            max_write_failures: 3,
            max_probe_ack_wait: Duration::from_secs(90),
            write_timeout: Duration::from_secs(5),
            publish_channel_capacity: 1024,
        }
    }
}
