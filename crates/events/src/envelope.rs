use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use datlake_core::CoreError;

/// Lineage event envelope carried as the payload of a queued item.
///
/// This is the unit producers enqueue and the processor consumes.
///
/// Notes:
/// - `run.runId` is the correlation id used on the stream.
/// - `job.namespace` defaults to `"default"` when absent.
/// - Fields the core does not interpret are kept in the `extra` maps so the
///   processor sees the envelope exactly as produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    pub run: LineageRun,
    pub job: LineageJob,
    #[serde(default)]
    pub inputs: Vec<JsonValue>,
    #[serde(default)]
    pub outputs: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRun {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageJob {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl LineageEvent {
    /// Decode a queued payload.
    ///
    /// Producers sometimes enqueue the envelope as a JSON string rather than
    /// a JSON object; both are accepted.
    pub fn decode(payload: &JsonValue) -> Result<Self, CoreError> {
        let parsed = match payload {
            JsonValue::String(raw) => serde_json::from_str::<LineageEvent>(raw),
            other => LineageEvent::deserialize(other),
        };

        let event = parsed.map_err(|e| CoreError::validation(format!("invalid lineage envelope: {e}")))?;

        if event.run.run_id.trim().is_empty() {
            return Err(CoreError::validation("invalid lineage envelope: empty runId"));
        }
        if event.job.name.trim().is_empty() {
            return Err(CoreError::validation("invalid lineage envelope: empty job name"));
        }

        Ok(event)
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    pub fn namespace(&self) -> &str {
        &self.job.namespace
    }
}
