//! Transactional Outbox
//!
//! Events are written through the same transaction handle as the
//! aggregate change that produced them, so both commit or neither does.
//! A processor later delivers unprocessed events to a sink, marking each
//! one processed on success and counting failures until the retry cap
//! quarantines it.
//!
//! Delivery is at-least-once: a crash between a successful publish and
//! `mark_as_processed` redelivers the event.

pub mod postgres;
pub mod processor;
pub mod sink;

pub use postgres::PgOutboxStore;
pub use processor::{DrainReport, OutboxProcessor, OutboxWorker};
pub use sink::{BroadcastSink, DeliveryError, DeliverySink, LoggingSink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageError;

/// Default retry cap before an event is quarantined
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest failure reason kept on a record
const MAX_ERROR_LEN: usize = 1024;

/// Outbox record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    /// Serialized event body, opaque to the outbox
    pub payload: String,
    pub occurred_on: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Reason of the most recent failed delivery
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Unprocessed and out of delivery attempts
    pub fn is_quarantined(&self, max_retries: u32) -> bool {
        !self.is_processed() && self.retry_count >= max_retries
    }
}

/// Event to append to the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// Serialize `event` as the JSON payload
    pub fn json<E: Serialize>(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, OutboxError> {
        let payload = serde_json::to_string(event)?;
        Ok(Self::new(aggregate_id, aggregate_type, event_type, payload))
    }

    /// Stamp identity and occurrence time
    pub fn into_record(self) -> OutboxEvent {
        OutboxEvent {
            id: Uuid::new_v4(),
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            payload: self.payload,
            occurred_on: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Outbox persistence
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Transaction handle shared with the backend's `TransactionManager`
    type Tx: Send;

    /// Append an event inside the caller's transaction
    async fn save_event(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, OutboxError>;

    /// Unprocessed events under the retry cap, oldest first
    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Record a successful delivery; repeating it is a no-op
    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Record a failed delivery and return the new retry count
    ///
    /// Processed events are left untouched.
    async fn increment_retry(&self, id: Uuid, reason: &str) -> Result<u32, OutboxError>;

    /// Unprocessed events that reached the retry cap, oldest first
    async fn get_quarantined_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Reset the retry count of a quarantined event so it is delivered again
    async fn requeue(&self, id: Uuid) -> Result<(), OutboxError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError>;

    /// Retry cap applied by `get_unprocessed_events`
    fn max_retries(&self) -> u32;
}

/// Errors that can occur in the outbox
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox event not found: {0}")]
    NotFound(Uuid),

    #[error("Failed to serialize event payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OutboxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OutboxError::Storage(e) if e.is_transient())
    }
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Storage(StorageError::from(err))
    }
}

/// Bound a failure reason to `MAX_ERROR_LEN` bytes, cutting on a char boundary
pub(crate) fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_ERROR_LEN {
        return reason.to_string();
    }

    let mut end = MAX_ERROR_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
