//! Status - GetStatus の結果
//!
//! Plain snapshot, serializable so a presentation layer can persist or print it.

use serde::{Deserialize, Serialize};

use crate::bus::MessageCounts;
use crate::client::ClientStats;
use crate::domain::AgentLoad;
use crate::queue::{QueueCounts, QueueDepths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchStatus {
    pub queue_depths: QueueDepths,
    pub task_counts: QueueCounts,
    pub agent_loads: Vec<AgentLoad>,
    pub cache_hit_rate: f64,

    /// Tasks handed to the client and not yet reported back.
    pub in_flight: usize,

    /// Successful agent assignments since start.
    pub dispatched: u64,

    /// Times a task was pushed back because no agent could take it.
    pub no_eligible_agent: u64,

    pub client: ClientStats,
    pub messages: MessageCounts,
}

impl DispatchStatus {
    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queue_depths.total() == 0
            && self.in_flight == 0
            && self.task_counts.queued == 0
            && self.task_counts.assigned == 0
            && self.task_counts.running == 0
    }
}
