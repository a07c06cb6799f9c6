//! Message queue interface.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Queue errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("publish to '{destination}' failed: {reason}")]
    Publish { destination: String, reason: String },
}

/// Fire-and-forget publisher.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publishes `body` to `destination`, optionally hidden for `delay`.
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<(), QueueError>;
}
