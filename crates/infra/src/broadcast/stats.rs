//! Admin-facing views of the broadcaster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use datlake_core::SessionId;

use super::session::{SessionSnapshot, ZombieReason};

/// Cumulative zombie detection counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZombieDetection {
    pub total_detected: u64,
    pub detection_reasons: BTreeMap<ZombieReason, u64>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ZombieDetection {
    pub(crate) fn record(&mut self, reason: ZombieReason) {
        self.total_detected += 1;
        *self.detection_reasons.entry(reason).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastStats {
    pub connected_sessions: usize,
    pub healthy_sessions: usize,
    pub zombie_sessions: usize,
    pub replay_buffer_size: usize,
    pub zombie_detection: ZombieDetection,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZombieSnapshot {
    pub session_id: SessionId,
    pub reason: Option<ZombieReason>,
    pub detected_at: Option<DateTime<Utc>>,
    pub zombie_secs: Option<f64>,
    pub missed_probes: u32,
    pub queue_full_events: u32,
    pub write_failures: u32,
}

impl From<&SessionSnapshot> for ZombieSnapshot {
    fn from(s: &SessionSnapshot) -> Self {
        Self {
            session_id: s.session_id,
            reason: s.zombie_reason,
            detected_at: s.zombie_detected_at,
            zombie_secs: s.zombie_secs,
            missed_probes: s.missed_probes,
            queue_full_events: s.queue_full_events,
            write_failures: s.write_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZombieReport {
    pub current_zombies: usize,
    pub total_detected: u64,
    pub detection_reasons: BTreeMap<ZombieReason, u64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub zombies: Vec<ZombieSnapshot>,
}
