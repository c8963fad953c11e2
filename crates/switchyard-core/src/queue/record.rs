//! Task record: the task plus the transitions the queue allows on it.

use chrono::{DateTime, Utc};

use crate::domain::{AgentId, DispatchError, Task, TaskState};

/// Single source of truth for one active task.
///
/// Bands hold `TaskId`s only; every state change goes through here so the
/// `assigned_agent` invariant (set iff Assigned/Running) holds.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        let updated_at = task.created_at;
        Self { task, updated_at }
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    fn expect_state(&self, allowed: &[TaskState], to: TaskState) -> Result<(), DispatchError> {
        if allowed.contains(&self.task.state) {
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                task: self.task.id,
                from: self.task.state,
                to,
            })
        }
    }

    /// Queued -> Assigned
    pub fn assign(&mut self, agent: AgentId, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(&[TaskState::Queued], TaskState::Assigned)?;
        self.task.state = TaskState::Assigned;
        self.task.assigned_agent = Some(agent);
        self.updated_at = now;
        Ok(())
    }

    /// Assigned -> Running
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(&[TaskState::Assigned], TaskState::Running)?;
        self.task.state = TaskState::Running;
        self.task.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Completed. Returns the agent that ran it.
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<AgentId>, DispatchError> {
        self.expect_state(&[TaskState::Running], TaskState::Completed)?;
        self.task.state = TaskState::Completed;
        self.task.completed_at = Some(now);
        self.task.result = Some(result);
        self.updated_at = now;
        Ok(self.task.assigned_agent.take())
    }

    /// Assigned | Running -> Failed. Always counts the attempt.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(
            &[TaskState::Assigned, TaskState::Running],
            TaskState::Failed,
        )?;
        self.task.state = TaskState::Failed;
        self.task.assigned_agent = None;
        self.task.attempt += 1;
        self.task.last_error = Some(error);
        self.task.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Queued -> Failed, for tasks whose deadline passed before dispatch.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(&[TaskState::Queued], TaskState::Failed)?;
        self.task.state = TaskState::Failed;
        self.task.last_error = Some("deadline exceeded".to_string());
        self.task.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Failed -> Queued, for another attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(&[TaskState::Failed], TaskState::Queued)?;
        self.task.state = TaskState::Queued;
        self.task.completed_at = None;
        self.task.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal state -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_state(
            &[TaskState::Queued, TaskState::Assigned, TaskState::Running],
            TaskState::Cancelled,
        )?;
        self.task.state = TaskState::Cancelled;
        self.task.assigned_agent = None;
        self.task.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}
