//! Errors - エラー型と分類
//!
//! `ExecutionError` is what the external executor (and the bounded client on top
//! of it) reports; `DispatchError` is what the queue / registry / dispatcher
//! APIs report for programming or lookup errors. Expected conditions (empty
//! queue, no eligible agent) are `Option`s, not errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{AgentId, TaskId};
use super::task::TaskState;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, upstream overload, rate limiting. Worth retrying.
    Transient,
    /// Malformed request, unauthorized. Retrying cannot help.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("transient execution error: {0}")]
    Transient(String),

    #[error("permanent execution error: {0}")]
    Permanent(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: String },

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ExecutionError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ExecutionError::Permanent(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Transient(_) | ExecutionError::ExhaustedRetries { .. } => {
                ErrorKind::Transient
            }
            ExecutionError::Permanent(_) | ExecutionError::Cancelled => ErrorKind::Permanent,
        }
    }

    /// Retryable within a single `execute` call.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("agent {agent} is at capacity ({capacity})")]
    CapacityExceeded { agent: AgentId, capacity: u32 },

    #[error("task {task} is not assigned to agent {agent}")]
    NotAssigned { agent: AgentId, task: TaskId },

    #[error("invalid transition for {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
