//! Event processor boundary (the business logic run for each queued event).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use datlake_events::LineageEvent;

/// Error raised while processing an event.
///
/// Treated exactly like a rejected event: the item is dead-lettered with the
/// error text as diagnostic.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Failed(String),
    #[error("processor backend unavailable: {0}")]
    Backend(String),
}

/// Business logic applied to each decoded lineage event.
///
/// Must be idempotent: the queue delivers at-least-once, so the same logical
/// event can arrive more than once (visibility expiry, failed delete, crash).
///
/// - `Ok(true)`: processed, the item is deleted
/// - `Ok(false)`: rejected, the item is dead-lettered
/// - `Err(_)`: failed, the item is dead-lettered with the error text
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &LineageEvent) -> Result<bool, ProcessorError>;
}

#[async_trait]
impl<P> EventProcessor for Arc<P>
where
    P: EventProcessor + ?Sized,
{
    async fn process(&self, event: &LineageEvent) -> Result<bool, ProcessorError> {
        (**self).process(event).await
    }
}

/// Accepts every event and logs it.
///
/// Used when no lineage backend is wired in (dev/demo deployments).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl EventProcessor for LoggingProcessor {
    async fn process(&self, event: &LineageEvent) -> Result<bool, ProcessorError> {
        info!(
            event_type = %event.event_type,
            run_id = %event.run_id(),
            job = %event.job_name(),
            namespace = %event.namespace(),
            inputs = event.inputs.len(),
            outputs = event.outputs.len(),
            "lineage event accepted"
        );
        Ok(true)
    }
}
