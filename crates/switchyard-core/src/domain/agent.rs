//! Agent model: capability-tagged executors and their load / health view.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, Category};

/// Health as seen by the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,

    /// Too many recent failures (or a stale heartbeat). Never selected.
    Unhealthy,

    /// Cooldown elapsed; selectable again, the next release decides.
    Recovering,
}

impl Health {
    pub fn is_selectable(self) -> bool {
        !matches!(self, Health::Unhealthy)
    }
}

/// What a caller supplies to register (or re-register) an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub capabilities: BTreeSet<Category>,

    /// Maximum concurrent tasks.
    pub capacity: u32,

    /// Selection preference when load ratios tie. Defaults to 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: AgentId::new(id),
            capabilities: BTreeSet::new(),
            capacity,
            weight: default_weight(),
        }
    }

    pub fn capability(mut self, category: impl Into<String>) -> Self {
        self.capabilities.insert(Category::new(category));
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Snapshot of a registered agent.
///
/// Invariant: `current_load <= capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: BTreeSet<Category>,
    pub capacity: u32,
    pub weight: u32,
    pub current_load: u32,
    pub health: Health,
    pub total_completed: u64,
    pub total_failed: u64,

    /// Exponential moving average over release durations.
    pub average_latency_ms: f64,
}

impl Agent {
    pub fn from_spec(spec: AgentSpec) -> Self {
        Self {
            id: spec.id,
            capabilities: spec.capabilities,
            capacity: spec.capacity,
            weight: spec.weight,
            current_load: 0,
            health: Health::Healthy,
            total_completed: 0,
            total_failed: 0,
            average_latency_ms: 0.0,
        }
    }

    pub fn can_handle(&self, category: &Category) -> bool {
        self.capabilities.contains(category)
    }

    pub fn has_free_slot(&self) -> bool {
        self.current_load < self.capacity
    }
}

/// Per-agent line of the status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent: AgentId,
    pub load: u32,
    pub capacity: u32,
    pub health: Health,
}
