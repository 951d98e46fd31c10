//! Realtime notifications enqueued by producers for direct relay to the stream.

use serde_json::{Map, Value as JsonValue};

use datlake_core::CoreError;

use crate::payload::{EventPayload, JobStatus, SystemMetric};

/// Decode a notification document into the payload it should be broadcast as.
///
/// Recognised `type` values:
/// - `job_status` → `job-status`
/// - `system_metric` → `system-metric`
///
/// Anything else is relayed as a `system-metric` with
/// `metric_type = "notification"` and the whole document as the value.
pub fn decode_notification(raw: &JsonValue) -> Result<EventPayload, CoreError> {
    let owned;
    let doc = match raw {
        JsonValue::String(s) => {
            owned = serde_json::from_str::<JsonValue>(s)
                .map_err(|e| CoreError::validation(format!("invalid notification: {e}")))?;
            &owned
        }
        other => other,
    };

    let obj = doc
        .as_object()
        .ok_or_else(|| CoreError::validation("invalid notification: expected an object"))?;

    let kind = obj.get("type").and_then(JsonValue::as_str).unwrap_or("general");

    let payload = match kind {
        "job_status" => EventPayload::JobStatus(JobStatus {
            job_name: str_field(obj, "job_name"),
            run_id: str_field(obj, "run_id"),
            status: str_field(obj, "status"),
            progress: obj
                .get("progress")
                .and_then(JsonValue::as_u64)
                .map(|p| p.min(100) as u8),
            metadata: map_field(obj, "metadata"),
        }),
        "system_metric" => EventPayload::SystemMetric(SystemMetric {
            metric_type: str_field(obj, "metric_type"),
            value: obj.get("value").cloned().unwrap_or(JsonValue::Null),
            metadata: map_field(obj, "metadata"),
        }),
        _ => EventPayload::SystemMetric(SystemMetric {
            metric_type: "notification".to_string(),
            value: doc.clone(),
            metadata: Map::new(),
        }),
    };

    Ok(payload)
}

fn str_field(obj: &Map<String, JsonValue>, key: &str) -> String {
    obj.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn map_field(obj: &Map<String, JsonValue>, key: &str) -> Map<String, JsonValue> {
    obj.get(key)
        .and_then(JsonValue::as_object)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::topic::Topic;

    #[test]
    fn job_status_notification() {
        let payload = decode_notification(&json!({
            "type": "job_status",
            "job_name": "daily_sales",
            "run_id": "r1",
            "status": "running",
            "progress": 40
        }))
        .unwrap();

        match payload {
            EventPayload::JobStatus(s) => {
                assert_eq!(s.job_name, "daily_sales");
                assert_eq!(s.progress, Some(40));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn missing_fields_fall_back_to_unknown() {
        let payload = decode_notification(&json!({"type": "job_status"})).unwrap();
        let EventPayload::JobStatus(s) = payload else {
            panic!("expected job status");
        };
        assert_eq!(s.run_id, "unknown");
        assert_eq!(s.progress, None);
    }

    #[test]
    fn generic_notification_becomes_system_metric() {
        let payload = decode_notification(&json!({"hello": "world"})).unwrap();
        assert_eq!(payload.topic(), Topic::SystemMetric);
    }

    #[test]
    fn string_encoded_notification_is_parsed() {
        let raw = JsonValue::String(r#"{"type":"system_metric","metric_type":"cpu","value":0.5}"#.into());
        let EventPayload::SystemMetric(m) = decode_notification(&raw).unwrap() else {
            panic!("expected metric");
        };
        assert_eq!(m.metric_type, "cpu");
        assert_eq!(m.value, json!(0.5));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(decode_notification(&json!([1, 2])).is_err());
        assert!(decode_notification(&JsonValue::String("{".into())).is_err());
    }
}
