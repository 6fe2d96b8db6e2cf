//! Job queue layer
//!
//! Durable named queues carrying serialized job payloads. A consumer takes one
//! delivery at a time and must either ack it (accepted) or reject it
//! (undecodable). Deliveries held by a runner that died are returned to their
//! queue by the cleaner.

mod cleaner;
#[cfg(test)]
mod memory;
mod redis_queue;

use async_trait::async_trait;
use thiserror::Error;

// Re-export implementations
pub use cleaner::QueueCleaner;
#[cfg(test)]
pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One payload taken from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
}

/// Queue trait for consuming and publishing job payloads
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Takes the next payload of `queue`, if any
    ///
    /// The payload stays unacknowledged until [`JobQueue::ack`] or
    /// [`JobQueue::reject`] is called.
    async fn next(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Moves a delivery to the rejected list of its queue
    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Signals that this runner is alive and still owns its deliveries
    async fn heartbeat(&self) -> Result<(), QueueError>;

    /// Returns deliveries of dead runners to their queues
    ///
    /// Returns the number of payloads moved back.
    async fn reclaim(&self, queues: &[&str]) -> Result<usize, QueueError>;
}
