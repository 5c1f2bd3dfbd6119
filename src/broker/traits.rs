use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Publish queue is full")]
    Backlogged,
    #[error("Publisher is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Broker connection failed: {0}")]
    Connection(String),
    #[error("Declaration rejected: {0}")]
    Declare(String),
    #[error("Acknowledgment failed: {0}")]
    Ack(String),
    #[error("Delivery cannot be relayed: {0}")]
    Relay(String),
}

/// Outbound side of a broker backend.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// (Re)establish the broker connection and declare what publishing needs.
    async fn connect(&self) -> Result<(), PublishError>;
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError>;
    async fn close(&self);
}

/// Inbound side of a broker backend.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Connect, declare exchange/queue/binding, and start consuming with
    /// manual acknowledgment and a prefetch of one.
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, SubscribeError>;
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// `None` once the broker side has gone away.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, SubscribeError>>;
    /// Close the consuming channel; unacknowledged deliveries return to the queue.
    async fn close(&mut self);
}

#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<(), SubscribeError>;
}

/// A broker message plus the handle that acknowledges it.
///
/// `ack` consumes the delivery, so it can be acknowledged at most once;
/// dropping it instead leaves redelivery to the broker.
pub struct Delivery {
    payload: Bytes,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: Box<dyn Acknowledger>) -> Self {
        Self { payload, acker }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub async fn ack(self) -> Result<(), SubscribeError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
