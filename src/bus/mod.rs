//! Broker transport seam.
//!
//! This module contains:
//! - `BusError`: every failure the client reports
//! - `Connection`, `PublishChannel`, `DeliveryStream`, `Acknowledge`: the
//!   transport traits the client drives
//! - `Message`, `Delivery`, `Handler`: values flowing through the client
//! - Implementations: AMQP (RabbitMQ), Mock

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use mock::MockConnection;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Delivery already acknowledged")]
    AlreadyAcknowledged,

    /// Publish was attempted after shutdown began. Not retryable on this client.
    #[error("Publisher is dead: client is shutting down")]
    PublisherDead,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Error returned by a subscription handler.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

// ============================================================================
// Values
// ============================================================================

/// Outbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    routing_key: String,
    body: Bytes,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Acknowledgment state of a delivery.
///
/// There is no local timeout: a delivery left in `PendingAck` is redelivered
/// on the broker's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    PendingAck,
    Acked,
}

/// Inbound message with the capability to acknowledge it.
pub struct Delivery {
    routing_key: String,
    body: Bytes,
    acker: Box<dyn Acknowledge>,
    state: AckState,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            acker,
            state: AckState::PendingAck,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn state(&self) -> AckState {
        self.state
    }

    /// Acknowledge the delivery. A delivery is acknowledged at most once.
    ///
    /// A failed ack leaves the delivery pending.
    pub async fn ack(&mut self) -> Result<()> {
        if self.state == AckState::Acked {
            return Err(BusError::AlreadyAcknowledged);
        }
        self.acker.ack().await?;
        self.state = AckState::Acked;
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for processing delivered payloads.
///
/// Returning an error leaves the delivery unacknowledged.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, body: Bytes) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, body: Bytes) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(body))
    }
}

/// A live broker connection.
///
/// Implementations own reconnection; the client only observes errors.
///
/// Implementations:
/// - `AmqpConnection`: RabbitMQ via AMQP
/// - `MockConnection`: In-memory transport for testing
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Wait for the next transport-level error.
    ///
    /// Returns `None` once the transport will report no more errors.
    async fn next_error(&self) -> Option<BusError>;

    /// Open a channel for publishing into `exchange`.
    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>>;

    /// Register a consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Close the physical connection.
    async fn close(&self);
}

/// Channel bound to one exchange.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()>;
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, a consumer-level error, or `None` when the consumer is gone for good.
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

/// Acknowledgment capability carried by a delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}
