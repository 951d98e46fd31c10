use std::time::Duration;

use datlake_core::MessageId;

use crate::envelope::LineageEvent;
use crate::event::BroadcastEvent;
use crate::payload::{EventPayload, ItemProcessed, ItemStatus};

/// Event type reported for items whose envelope could not be decoded.
pub const UNDECODABLE_EVENT_TYPE: &str = "unknown";

/// Result of processing one dequeued item.
///
/// Created once per item after the processor returns; immutable. Feeds both
/// the broadcaster (as a `queue-item-processed` event) and metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOutcome {
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub job_name: Option<String>,
    pub namespace: Option<String>,
    pub message_id: MessageId,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl ProcessingOutcome {
    pub fn succeeded(event: &LineageEvent, message_id: MessageId, duration: Duration) -> Self {
        Self {
            event_type: event.event_type.clone(),
            correlation_id: Some(event.run_id().to_string()),
            job_name: Some(event.job_name().to_string()),
            namespace: Some(event.namespace().to_string()),
            message_id,
            duration,
            success: true,
            error: None,
        }
    }

    pub fn failed(
        event: &LineageEvent,
        message_id: MessageId,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::succeeded(event, message_id, duration)
        }
    }

    /// Outcome for an item that never reached the processor.
    pub fn undecodable(message_id: MessageId, error: impl Into<String>) -> Self {
        Self {
            event_type: UNDECODABLE_EVENT_TYPE.to_string(),
            correlation_id: None,
            job_name: None,
            namespace: None,
            message_id,
            duration: Duration::ZERO,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> ItemStatus {
        if self.success {
            ItemStatus::Completed
        } else {
            ItemStatus::Failed
        }
    }

    /// Stream representation. The error string stays server-side.
    pub fn to_event(&self) -> BroadcastEvent {
        BroadcastEvent::new(EventPayload::QueueItemProcessed(ItemProcessed {
            event_type: self.event_type.clone(),
            run_id: self.correlation_id.clone(),
            job_name: self.job_name.clone(),
            namespace: self.namespace.clone(),
            message_id: self.message_id,
            status: self.status(),
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::topic::Topic;

    #[test]
    fn failed_outcome_hides_error_from_stream() {
        let event = LineageEvent::decode(&json!({
            "eventType": "FAIL",
            "run": {"runId": "r9"},
            "job": {"name": "load"}
        }))
        .unwrap();
        let outcome = ProcessingOutcome::failed(
            &event,
            MessageId::new(7),
            Duration::from_millis(12),
            "constraint violated on lineage_runs",
        );

        let broadcast = outcome.to_event();
        assert_eq!(broadcast.topic(), Topic::QueueItemProcessed);

        let data = broadcast.data_json();
        assert_eq!(data["data"]["status"], "failed");
        assert_eq!(data["data"]["run_id"], "r9");
        assert_eq!(data["data"]["duration_ms"], 12);
        assert!(!data.to_string().contains("constraint"));
    }

    #[test]
    fn undecodable_outcome_has_no_correlation() {
        let outcome = ProcessingOutcome::undecodable(MessageId::new(3), "bad json");
        assert_eq!(outcome.event_type, UNDECODABLE_EVENT_TYPE);
        assert!(outcome.correlation_id.is_none());
        assert_eq!(outcome.status(), ItemStatus::Failed);
    }
}
