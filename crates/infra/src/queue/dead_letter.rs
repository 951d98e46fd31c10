use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use datlake_core::MessageId;

use super::store::QueueItem;

/// Document written to the dead-letter queue for a failed item.
///
/// The original payload is kept verbatim so the item can be inspected and,
/// if needed, re-enqueued by hand. Nothing consumes the dead-letter queue
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_message: JsonValue,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub msg_id: MessageId,
    pub source_queue: String,
    pub read_count: u32,
}

impl DeadLetterRecord {
    pub fn new(item: &QueueItem, source_queue: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            original_message: item.payload.clone(),
            error: error.into(),
            failed_at: Utc::now(),
            msg_id: item.message_id,
            source_queue: source_queue.into(),
            read_count: item.read_count,
        }
    }
}
