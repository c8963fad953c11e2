//! Queue module: priority bands, task lifecycle and retry accounting.

mod memory;
mod record;

pub use memory::TaskQueue;
pub use record::TaskRecord;

use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, TaskState};

/// What `mark_failed` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back at the tail of its band; `attempt` attempts have failed so far.
    Requeued { attempt: u32 },
    /// Terminal.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was queued, now cancelled.
    Removed,
    /// Assigned or running; the execution has to be stopped first.
    InFlight { agent: Option<AgentId> },
    AlreadyTerminal(TaskState),
}

/// Tasks waiting in each band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Active tasks per state, plus lifetime totals of terminal states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
