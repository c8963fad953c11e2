//! Task model: priority bands, lifecycle state and the closed set of payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AgentId, Category, TaskId};

/// Priority band of a task. Dispatch is strict: every `High` task is handed out
/// before any `Normal` one, every `Normal` before any `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Bands in dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Band index, 0 is dispatched first.
    pub fn band(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Task lifecycle.
///
/// State transitions:
/// - Queued -> Assigned -> Running -> Completed
/// - Queued -> Assigned -> Running -> Failed -> Queued (retry, while budget remains)
/// - Queued -> Assigned -> Running -> Failed (terminal)
/// - Queued | Assigned | Running -> Cancelled
/// - Queued -> Failed (deadline passed before dispatch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Does a task in this state hold an agent slot?
    pub fn holds_agent(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

/// Task-specific data. Kept to a small closed set so executors can match on it;
/// `Json` is the escape hatch for anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskPayload {
    /// A prompt for a language-model backed agent.
    Prompt {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// A document to process (OCR, extraction, conversion, ...).
    Document { uri: String, operation: String },

    /// Ask several agents to work on one topic together.
    Collaborate { topic: String, participants: u32 },

    /// Arbitrary structured payload.
    Json(serde_json::Value),
}

impl TaskPayload {
    pub fn prompt(text: impl Into<String>) -> Self {
        TaskPayload::Prompt {
            text: text.into(),
            model: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Prompt { .. } => "prompt",
            TaskPayload::Document { .. } => "document",
            TaskPayload::Collaborate { .. } => "collaborate",
            TaskPayload::Json(_) => "json",
        }
    }
}

/// Snapshot of a task as seen through the control surface.
///
/// Invariant: `assigned_agent` is `Some` iff `state` is Assigned or Running.
/// Only the task queue mutates these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub category: Category,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub state: TaskState,

    /// Lookup-only reference; the registry owns the agent.
    pub assigned_agent: Option<AgentId>,

    /// Number of failed dispatch attempts so far.
    pub attempt: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Tasks still queued after this instant are failed instead of dispatched.
    pub deadline: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Executor response, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        id: TaskId,
        category: Category,
        priority: Priority,
        payload: TaskPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            category,
            priority,
            payload,
            state: TaskState::Queued,
            assigned_agent: None,
            attempt: 0,
            created_at,
            started_at: None,
            completed_at: None,
            deadline: None,
            last_error: None,
            result: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn bands_follow_dispatch_order() {
        let bands: Vec<usize> = Priority::ALL.iter().map(|p| p.band()).collect();
        assert_eq!(bands, vec![0, 1, 2]);
        assert!(Priority::High < Priority::Low);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Assigned.holds_agent());
        assert!(!TaskState::Queued.holds_agent());
    }

    #[test]
    fn payload_is_tagged_enum() {
        let p = TaskPayload::Document {
            uri: "s3://bucket/scan.pdf".to_string(),
            operation: "ocr".to_string(),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["kind"], "document");
        assert_eq!(v["value"]["operation"], "ocr");
        assert_eq!(p.kind(), "document");
    }

    #[test]
    fn deadline_expiry() {
        let now = Utc::now();
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            Category::from("ocr"),
            Priority::High,
            TaskPayload::prompt("hi"),
            now,
        )
        .with_deadline(now + chrono::Duration::seconds(5));

        assert!(!task.is_expired(now));
        assert!(task.is_expired(now + chrono::Duration::seconds(6)));
    }
}
