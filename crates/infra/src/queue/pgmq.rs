//! PGMQ-backed work queue store.
//!
//! Talks to the `pgmq` Postgres extension through its SQL functions:
//!
//! | Operation | SQL |
//! |-----------|-----|
//! | lease | `pgmq.read_with_poll(queue, vt, qty, max_poll_seconds)` |
//! | delete | `pgmq.delete(queue, msg_id)` |
//! | send | `pgmq.send(queue, message)` |
//! | dead_letter | `pgmq.delete` + `pgmq.send` in one transaction |
//! | length | `pgmq.metrics(queue).queue_length` |
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueStoreError |
//! |------------|-----------------|
//! | Io, Tls, PoolTimedOut, PoolClosed | `Unavailable` |
//! | Database `42P01` (undefined table) | `QueueNotFound` |
//! | Anything else | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use datlake_core::MessageId;

use super::store::{QueueItem, QueueStoreError, WorkQueueStore};

#[derive(Debug, Clone)]
pub struct PgmqQueueStore {
    pool: Arc<PgPool>,
}

impl PgmqQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a connection pool. Failure here is fatal at startup.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, QueueStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!(max_connections, "connected to queue database");
        Ok(Self::new(pool))
    }

    /// Create the given queues if they do not exist yet.
    pub async fn ensure_queues(&self, queues: &[&str]) -> Result<(), QueueStoreError> {
        for queue in queues {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(*queue)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueueStore for PgmqQueueStore {
    #[instrument(skip(self), err)]
    async fn lease(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT msg_id, read_ct, message
            FROM pgmq.read_with_poll($1, $2, $3, $4)
            "#,
        )
        .bind(queue)
        .bind(whole_secs(visibility, 1))
        .bind(i32::try_from(max_items).unwrap_or(i32::MAX))
        .bind(whole_secs(wait, 1))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        rows.into_iter()
            .map(|row| {
                let message_id: i64 = row.try_get("msg_id").map_err(|e| map_sqlx_error("lease", e))?;
                let read_count: i32 = row.try_get("read_ct").map_err(|e| map_sqlx_error("lease", e))?;
                let payload: JsonValue =
                    row.try_get("message").map_err(|e| map_sqlx_error("lease", e))?;
                Ok(QueueItem {
                    message_id: MessageId::new(message_id),
                    payload,
                    read_count: u32::try_from(read_count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn delete(&self, queue: &str, message_id: MessageId) -> Result<bool, QueueStoreError> {
        let row = sqlx::query("SELECT pgmq.delete($1::text, $2::bigint) AS deleted")
            .bind(queue)
            .bind(message_id.get())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        row.try_get::<bool, _>("deleted")
            .map_err(|e| map_sqlx_error("delete", e))
    }

    async fn send(&self, queue: &str, payload: JsonValue) -> Result<MessageId, QueueStoreError> {
        let row = sqlx::query("SELECT pgmq.send($1::text, $2::jsonb) AS msg_id")
            .bind(queue)
            .bind(payload)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("send", e))?;
        let id: i64 = row.try_get("msg_id").map_err(|e| map_sqlx_error("send", e))?;
        Ok(MessageId::new(id))
    }

    #[instrument(skip(self, payload), err)]
    async fn dead_letter(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        message_id: MessageId,
        payload: JsonValue,
    ) -> Result<Option<MessageId>, QueueStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        let deleted: bool = sqlx::query("SELECT pgmq.delete($1::text, $2::bigint) AS deleted")
            .bind(queue)
            .bind(message_id.get())
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("deleted"))
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        if !deleted {
            // Someone else already finished this message.
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("dead_letter", e))?;
            return Ok(None);
        }

        let dlq_id: i64 = sqlx::query("SELECT pgmq.send($1::text, $2::jsonb) AS msg_id")
            .bind(dead_letter_queue)
            .bind(payload)
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("msg_id"))
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;
        Ok(Some(MessageId::new(dlq_id)))
    }

    async fn length(&self, queue: &str) -> Result<u64, QueueStoreError> {
        let row = sqlx::query("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("length", e))?;
        let len: i64 = row
            .try_get("queue_length")
            .map_err(|e| map_sqlx_error("length", e))?;
        Ok(u64::try_from(len).unwrap_or(0))
    }
}

/// PGMQ takes whole seconds; round up and never go below `min`.
fn whole_secs(d: Duration, min: i32) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX).max(min)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => {
            QueueStoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => QueueStoreError::QueueNotFound(msg),
                _ => QueueStoreError::Storage(msg),
            }
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
