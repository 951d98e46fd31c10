//! Broadcast topics a subscriber can opt into.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use datlake_core::CoreError;

/// Named category of broadcast event.
///
/// The wire name (kebab-case) is what appears on the `event:` line of a
/// stream record and what clients pass when subscribing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    QueueItemProcessed,
    JobStatus,
    SystemMetric,
    LivenessProbe,
    LivenessHeartbeat,
    Error,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::QueueItemProcessed,
        Topic::JobStatus,
        Topic::SystemMetric,
        Topic::LivenessProbe,
        Topic::LivenessHeartbeat,
        Topic::Error,
    ];

    /// Topics a client gets when it does not ask for any.
    pub const DEFAULT_SUBSCRIPTION: [Topic; 3] =
        [Topic::QueueItemProcessed, Topic::JobStatus, Topic::SystemMetric];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::QueueItemProcessed => "queue-item-processed",
            Topic::JobStatus => "job-status",
            Topic::SystemMetric => "system-metric",
            Topic::LivenessProbe => "liveness-probe",
            Topic::LivenessHeartbeat => "liveness-heartbeat",
            Topic::Error => "error",
        }
    }

    /// Liveness topics are written directly by a session's delivery loop and
    /// never go through publish/replay.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Topic::LivenessProbe | Topic::LivenessHeartbeat)
    }

    /// Parse a comma separated topic list (`"job-status, error"`).
    ///
    /// Empty segments are ignored; an empty list yields an empty vec and the
    /// caller decides on defaults.
    pub fn parse_list(raw: &str) -> Result<Vec<Topic>, CoreError> {
        let mut topics = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let topic = part.parse::<Topic>()?;
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        Ok(topics)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept snake_case too; older clients send `job_status`.
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| CoreError::validation(format!("unknown topic: {s}")))
    }
}
