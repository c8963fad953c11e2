//! ResultSink implementations for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::TaskId;
use crate::ports::{ResultSink, SinkError};

/// Keeps every stored result in memory.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    results: Mutex<HashMap<TaskId, serde_json::Value>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: TaskId) -> Option<serde_json::Value> {
        self.results.lock().get(&task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn store(&self, task_id: TaskId, result: &serde_json::Value) -> Result<(), SinkError> {
        self.results.lock().insert(task_id, result.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResultSink;

#[async_trait]
impl ResultSink for NoopResultSink {
    async fn store(&self, _task_id: TaskId, _result: &serde_json::Value) -> Result<(), SinkError> {
        Ok(())
    }
}
