//! Delivery sinks
//!
//! Where the outbox processor hands events off to. Anything that fails or
//! times out counts as a failed delivery attempt.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::OutboxEvent;

/// Delivery failure reported by a sink
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Downstream consumer of outbox events
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), DeliveryError>;
}

/// Sink that only logs events
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl DeliverySink for LoggingSink {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            retry_count = event.retry_count,
            "Outbox event published"
        );
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel
///
/// Publishing with no live subscriber fails, so the event stays pending
/// until someone is listening.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<OutboxEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl DeliverySink for BroadcastSink {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| DeliveryError::Unavailable("no active subscribers".to_string()))
    }
}
