//! Queue transport seam: subscribe, reply, retry, dead-letter.
//!
//! The dispatcher only sees this trait. The Kafka transport is the
//! production implementation; the channel transport backs tests and local
//! development.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::RenderReplyEnvelope;

pub use kafka::KafkaTransport;
pub use memory::ChannelTransport;

/// One consumed message. `attempt` starts at 1 and counts every delivery
/// of the same payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub attempt: u32,
}

impl Delivery {
    pub fn first(payload: Vec<u8>, key: Option<String>) -> Self {
        Self {
            payload,
            key,
            attempt: 1,
        }
    }
}

/// What became of a retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The transport will redeliver after its backoff.
    Scheduled { next_attempt: u32 },
    /// The retry budget is spent; the message went to the dead letter.
    Exhausted,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("queue consume failed: {0}")]
    Consume(String),
    #[error("queue publish failed: {0}")]
    Publish(String),
    #[error("transport configuration rejected: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Next message, or `None` once the stream is closed for good.
    async fn receive(&self) -> Result<Option<Delivery>, TransportError>;

    /// Publish a reply to the result route, keyed by correlation id.
    async fn publish_reply(&self, reply: &RenderReplyEnvelope) -> Result<(), TransportError>;

    /// Hand a failed message back. The transport applies exponential
    /// backoff (`retry_delay * 2^(attempt-1)`) and routes to the dead
    /// letter once the budget is exhausted.
    async fn retry(&self, delivery: Delivery, reason: &str) -> Result<RetryOutcome, TransportError>;

    /// Mark a message fully handled.
    async fn complete(&self, delivery: Delivery) -> Result<(), TransportError>;

    /// Park a message that can never be processed.
    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<(), TransportError>;
}
