//! `datlake-events`: the event model shared by the queue processor and the
//! stream layer.
//!
//! - [`LineageEvent`]: the envelope decoded from a queued item
//! - [`ProcessingOutcome`]: what happened to one item
//! - [`BroadcastEvent`] / [`EventPayload`]: what subscribers receive, keyed by [`Topic`]

pub mod envelope;
pub mod event;
pub mod notification;
pub mod outcome;
pub mod payload;
pub mod topic;

pub use envelope::{LineageEvent, LineageJob, LineageRun};
pub use event::BroadcastEvent;
pub use notification::decode_notification;
pub use outcome::{ProcessingOutcome, UNDECODABLE_EVENT_TYPE};
pub use payload::{
    ErrorNotice, EventPayload, Heartbeat, ItemProcessed, ItemStatus, JobStatus, LivenessProbe,
    SystemMetric,
};
pub use topic::Topic;
