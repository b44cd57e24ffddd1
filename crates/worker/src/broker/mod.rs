//! Message broker contract.
//!
//! The consumer only needs three things from a broker: a subscription to a
//! named queue with a prefetch limit, manual acknowledgement of each
//! delivery, and the ability to hand a delivery back for redelivery.
//! [`amqp::AmqpBroker`] implements this over RabbitMQ;
//! [`memory::MemoryBroker`] is the in-process reference used by tests.

use async_trait::async_trait;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Queue carrying render requests from the intake service to renderers.
pub const REQUESTS_QUEUE: &str = "mapnik";

/// Queue carrying completion results from renderers back to this worker.
pub const RESULTS_QUEUE: &str = "maps";

/// Errors surfaced by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to establish a connection to the broker.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Channel-level failure on an established connection (declare, qos,
    /// consume, or the channel closing under us).
    #[error("Broker channel error: {0}")]
    Channel(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `queue` (durable) and start consuming it with manual
    /// acknowledgement and at most `prefetch` unacknowledged deliveries.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Declare `queue` (durable) and publish a persistent message to it.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the underlying connection or channel has closed;
    /// the subscription is then dead and a new one must be opened.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>>;

    /// Release the subscription's connection resources. Closing an already
    /// dead subscription succeeds.
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Remove the message from the queue.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Return the message to the queue for redelivery.
    async fn requeue(self: Box<Self>) -> Result<(), BrokerError>;
}
