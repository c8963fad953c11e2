//! ResultSink port - where completed task results go.
//!
//! Fire-and-forget from the dispatcher's point of view: failures are logged,
//! never retried.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Error)]
#[error("result sink error: {0}")]
pub struct SinkError(pub String);

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, task_id: TaskId, result: &serde_json::Value) -> Result<(), SinkError>;
}
