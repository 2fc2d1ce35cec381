use async_trait::async_trait;

/// A verified envelope on its way into the durable broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    /// Survive a broker restart until acknowledged.
    pub persistent: bool,
}

impl QueueMessage {
    pub fn durable(queue: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            persistent: true,
        }
    }
}

/// One message handed to a consumer, owned by the broker until acked/nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish not confirmed by broker: {0}")]
    NotConfirmed(String),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("in-flight limit of {0} unacknowledged deliveries reached")]
    PrefetchExceeded(usize),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Errors that mean the channel is gone and must be re-dialed.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::NotConfirmed(_))
    }
}

#[async_trait]
pub trait BrokerPublisher: Send {
    /// Make the broker retain everything published to `queue` from now on,
    /// whether or not its consumer has ever attached. Idempotent.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Publish and wait for the broker to take ownership of the message.
    async fn publish(&mut self, msg: &QueueMessage) -> Result<(), BrokerError>;

    /// Service an otherwise idle channel (heartbeats, control packets).
    /// Pending for as long as the channel is healthy; returns the error
    /// that ended it. Must be safe to drop at any await point.
    async fn keep_alive(&mut self) -> BrokerError;
}

#[async_trait]
pub trait BrokerConsumer: Send {
    /// Next delivery from the subscribed queue; `None` once the subscription
    /// has ended (cancelled or closed by the broker).
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// Remove the delivery from the broker permanently.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Release the delivery; with `requeue` the broker delivers it again later.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;
}
