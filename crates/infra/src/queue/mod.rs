//! Work queue abstraction.
//!
//! Delivery is at-least-once: a received message is hidden for the visibility
//! window and becomes receivable again unless it is deleted first. There is no
//! ordering guarantee and the same message can reach two workers.

use std::sync::Arc;
use std::time::Duration;

use jobmesh_core::TaskMessage;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsWorkQueue;

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Broker unreachable or command failed; retrying later may succeed.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    /// The receipt no longer owns the message (redelivered or already deleted).
    #[error("receipt expired: {0}")]
    ReceiptExpired(String),
}

/// Opaque token proving ownership of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: ReceiptHandle,
    pub message_id: String,
    /// Raw body; parsing is the consumer's job so malformed bodies can be dropped.
    pub body: String,
    /// 1 on first delivery
    pub receive_count: u32,
}

/// Work queue contract shared by the orchestrator (publish) and workers.
pub trait WorkQueue: Send + Sync {
    /// Publish a task message. Returns the broker message id.
    fn publish(&self, message: &TaskMessage) -> Result<String, QueueError>;

    /// Long-poll for up to `max_messages` deliveries, waiting at most `wait`.
    ///
    /// An empty batch after the wait is not an error.
    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Permanently remove a delivered message.
    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn publish(&self, message: &TaskMessage) -> Result<String, QueueError> {
        (**self).publish(message)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(max_messages, wait)
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt)
    }
}
