//! Bus messages: out-of-band control / collaboration traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, MessageId, TaskId};

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessagePayload {
    /// "These agents, collaborate on this topic."
    Collaborate {
        topic: String,
        participants: Vec<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
    },

    /// Control command (pause, drain, reload, ...). Interpreted by the receiver.
    Control { command: String },

    Json(serde_json::Value),
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: AgentId,
    pub to: Recipient,

    /// Higher is delivered first.
    pub priority: i32,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,

    /// Set once, by the delivery loop.
    pub(crate) delivered: bool,
    pub(crate) state: DeliveryState,
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<String>,
}

impl Message {
    pub fn new(
        id: MessageId,
        from: AgentId,
        to: Recipient,
        priority: i32,
        payload: MessagePayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            from,
            to,
            priority,
            payload,
            created_at,
            delivered: false,
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn delivered(&self) -> bool {
        self.delivered
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Delivery callback invocations so far, across all recipients.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
