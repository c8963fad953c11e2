//! MessageHandler port - per-recipient delivery callback of the message bus.

use async_trait::async_trait;

use crate::domain::{AgentId, ExecutionError, Message};

/// Returning `Ok` marks this recipient as served. A `Transient` error is
/// retried with backoff; anything else fails the delivery immediately.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn deliver(&self, recipient: &AgentId, message: &Message) -> Result<(), ExecutionError>;
}
