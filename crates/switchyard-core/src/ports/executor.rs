//! Executor port - the remote capability an agent stands for.
//!
//! The dispatcher never talks to AI / OCR / document backends directly; it
//! hands a `RequestDescriptor` to an `Executor` together with the chosen agent.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, Category, ExecutionError, Task, TaskPayload};

/// What to execute. Everything in here takes part in the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub category: Category,
    pub payload: TaskPayload,

    /// Options that change the result (model, language, resolution, ...).
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(category: Category, payload: TaskPayload) -> Self {
        Self {
            category,
            payload,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

impl From<&Task> for RequestDescriptor {
    fn from(task: &Task) -> Self {
        Self::new(task.category.clone(), task.payload.clone())
    }
}

/// Executor は外部の実行系（AI / OCR / document backend）を呼び出す
///
/// Errors must be classified: `Transient` for timeouts / 5xx / rate limits,
/// `Permanent` for malformed or unauthorized requests.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentId,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<serde_json::Value, ExecutionError>;
}
