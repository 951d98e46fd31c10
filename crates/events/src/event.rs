use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};

use datlake_core::{EventId, ProbeId};

use crate::payload::{ErrorNotice, EventPayload, Heartbeat, JobStatus, LivenessProbe, SystemMetric};
use crate::topic::Topic;

/// An event fanned out to stream subscribers.
///
/// Events are:
/// - **immutable** once created (treat them as facts)
/// - identified by a time-ordered [`EventId`]
/// - shared between sessions behind an `Arc`, never copied per subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    id: EventId,
    created_at: DateTime<Utc>,
    payload: EventPayload,
}

impl BroadcastEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self::with_id(EventId::new(), Utc::now(), payload)
    }

    /// Build an event with explicit identity (tests, replays from elsewhere).
    pub fn with_id(id: EventId, created_at: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            id,
            created_at,
            payload,
        }
    }

    pub fn job_status(status: JobStatus) -> Self {
        Self::new(EventPayload::JobStatus(status))
    }

    pub fn system_metric(metric: SystemMetric) -> Self {
        Self::new(EventPayload::SystemMetric(metric))
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventPayload::Error(ErrorNotice::new(error_type, message)))
    }

    pub fn probe(probe_id: ProbeId) -> Self {
        Self::new(EventPayload::LivenessProbe(LivenessProbe::new(probe_id)))
    }

    pub fn heartbeat() -> Self {
        Self::new(EventPayload::LivenessHeartbeat(Heartbeat {}))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Creation time as fractional epoch seconds (the `timestamp` field on the wire).
    pub fn epoch_seconds(&self) -> f64 {
        self.created_at.timestamp_millis() as f64 / 1000.0
    }

    /// JSON body of the `data:` line: `{"timestamp": <epoch secs>, "data": {...}}`.
    pub fn data_json(&self) -> JsonValue {
        let data = serde_json::to_value(&self.payload).unwrap_or(JsonValue::Null);
        json!({
            "timestamp": self.epoch_seconds(),
            "data": data,
        })
    }

    /// Render the full newline-delimited stream record:
    ///
    /// ```text
    /// id: <event-id>
    /// event: <topic>
    /// data: {"timestamp": ..., "data": {...}}
    ///
    /// ```
    pub fn to_sse_frame(&self) -> String {
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.topic(),
            self.data_json()
        )
    }
}
