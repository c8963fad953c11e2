//! Events - ドメインイベント
//!
//! Emitted through the `EventSink` port; consumers subscribe explicitly.

use serde::{Deserialize, Serialize};

use super::agent::Health;
use super::ids::{AgentId, Category, TaskId};
use super::task::Priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    TaskQueued {
        task_id: TaskId,
        category: Category,
        priority: Priority,
    },
    TaskAssigned {
        task_id: TaskId,
        agent: AgentId,
    },
    TaskStarted {
        task_id: TaskId,
        agent: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent: Option<AgentId>,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        attempt: u32,
        /// `false` when the task went back to its band for another attempt.
        terminal: bool,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    AgentHealthChanged {
        agent: AgentId,
        from: Health,
        to: Health,
    },
}

impl LifecycleEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            LifecycleEvent::TaskQueued { task_id, .. }
            | LifecycleEvent::TaskAssigned { task_id, .. }
            | LifecycleEvent::TaskStarted { task_id, .. }
            | LifecycleEvent::TaskCompleted { task_id, .. }
            | LifecycleEvent::TaskFailed { task_id, .. }
            | LifecycleEvent::TaskCancelled { task_id } => Some(*task_id),
            LifecycleEvent::AgentHealthChanged { .. } => None,
        }
    }
}
