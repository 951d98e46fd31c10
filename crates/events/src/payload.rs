//! Per-topic payload shapes.
//!
//! Every topic has one concrete payload type; `metadata` maps are kept only
//! for passthrough fields whose shape genuinely varies per producer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use datlake_core::{CoreError, MessageId, ProbeId};

use crate::topic::Topic;

/// Tagged union of broadcast payloads, keyed by topic.
///
/// Serializes as the bare inner payload; the topic travels on the `event:`
/// line of the stream record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    QueueItemProcessed(ItemProcessed),
    JobStatus(JobStatus),
    SystemMetric(SystemMetric),
    LivenessProbe(LivenessProbe),
    LivenessHeartbeat(Heartbeat),
    Error(ErrorNotice),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::QueueItemProcessed(_) => Topic::QueueItemProcessed,
            EventPayload::JobStatus(_) => Topic::JobStatus,
            EventPayload::SystemMetric(_) => Topic::SystemMetric,
            EventPayload::LivenessProbe(_) => Topic::LivenessProbe,
            EventPayload::LivenessHeartbeat(_) => Topic::LivenessHeartbeat,
            EventPayload::Error(_) => Topic::Error,
        }
    }

    /// Build the payload for `topic` from caller supplied JSON.
    ///
    /// Liveness topics are rejected; those frames are only ever written by
    /// a session's own delivery loop.
    pub fn from_topic(topic: Topic, data: JsonValue) -> Result<Self, CoreError> {
        fn parse<T>(topic: Topic, data: JsonValue) -> Result<T, CoreError>
        where
            T: serde::de::DeserializeOwned,
        {
            serde_json::from_value(data)
                .map_err(|e| CoreError::validation(format!("invalid {topic} payload: {e}")))
        }

        Ok(match topic {
            Topic::QueueItemProcessed => EventPayload::QueueItemProcessed(parse(topic, data)?),
            Topic::JobStatus => EventPayload::JobStatus(parse(topic, data)?),
            Topic::SystemMetric => EventPayload::SystemMetric(parse(topic, data)?),
            Topic::Error => EventPayload::Error(parse(topic, data)?),
            Topic::LivenessProbe | Topic::LivenessHeartbeat => {
                return Err(CoreError::validation(format!("{topic} events cannot be broadcast")));
            }
        })
    }
}

/// Terminal status of a dequeued item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Failed,
}

/// Outcome of one queue item, as seen by stream clients.
///
/// Deliberately carries no error detail: failed items surface only as
/// `status = failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProcessed {
    pub event_type: String,
    pub run_id: Option<String>,
    pub job_name: Option<String>,
    pub namespace: Option<String>,
    pub message_id: MessageId,
    pub status: ItemStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    pub run_id: String,
    pub status: String,
    pub progress: Option<u8>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetric {
    pub metric_type: String,
    pub value: JsonValue,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

/// Probe that expects an acknowledgment addressed by session id + probe id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessProbe {
    pub probe_id: ProbeId,
    pub expects_ack: bool,
}

impl LivenessProbe {
    pub fn new(probe_id: ProbeId) -> Self {
        Self {
            probe_id,
            expects_ack: true,
        }
    }
}

/// Keep-alive frame; no response expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {}

/// Generic error notice. Never carries payload internals or error strings
/// from the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error_type: String,
    pub message: String,
}

impl ErrorNotice {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_without_a_tag() {
        let payload = EventPayload::Error(ErrorNotice::new("queue_unavailable", "retrying"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error_type": "queue_unavailable", "message": "retrying"})
        );
    }

    #[test]
    fn heartbeat_is_an_empty_object() {
        let json = serde_json::to_value(EventPayload::LivenessHeartbeat(Heartbeat {})).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn payloads_are_built_from_topic_and_json() {
        let payload = EventPayload::from_topic(
            Topic::JobStatus,
            serde_json::json!({"job_name": "load", "run_id": "r1", "status": "running", "progress": 5}),
        )
        .unwrap();
        assert_eq!(payload.topic(), Topic::JobStatus);

        let err = EventPayload::from_topic(Topic::JobStatus, serde_json::json!({"job_name": 1}));
        assert!(matches!(err, Err(CoreError::Validation(_))));

        let err = EventPayload::from_topic(Topic::LivenessProbe, serde_json::json!({}));
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[test]
    fn topic_follows_variant() {
        let probe = EventPayload::LivenessProbe(LivenessProbe::new(ProbeId::new()));
        assert_eq!(probe.topic(), Topic::LivenessProbe);
        assert!(probe.topic().is_liveness());
    }
}
