//! AgentRegistry - エージェント登録と負荷分散
//!
//! Sole owner of agent load and health. Selection picks, among selectable
//! agents that carry the category and have a free slot, the one with the
//! lowest `current_load / capacity`; ties go to the higher weight, then to the
//! earlier registration.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::health::{HealthTracker, Transition};
use crate::config::BalancerConfig;
use crate::domain::{
    Agent, AgentId, AgentLoad, AgentSpec, Category, DispatchError, LifecycleEvent, TaskId,
};
use crate::ports::{Clock, EventSink};

#[derive(Debug)]
struct AgentEntry {
    agent: Agent,
    /// Registration order, used as the last tie-breaker.
    seq: u64,
    in_flight: HashSet<TaskId>,
    tracker: HealthTracker,
    latency_samples: u64,
    /// Capacity as last registered. `agent.capacity` only exceeds it while
    /// the load is still above it.
    requested_capacity: u32,
}

impl AgentEntry {
    fn settle_capacity(&mut self) {
        self.agent.capacity = self.requested_capacity.max(self.agent.current_load);
    }

    fn is_eligible(&self, category: &Category) -> bool {
        self.agent.health.is_selectable()
            && self.agent.can_handle(category)
            && self.agent.has_free_slot()
    }

    /// `Less` means `self` is the better pick.
    fn compare(&self, other: &AgentEntry) -> Ordering {
        // load_a / cap_a vs load_b / cap_b without floats
        let lhs = u64::from(self.agent.current_load) * u64::from(other.agent.capacity);
        let rhs = u64::from(other.agent.current_load) * u64::from(self.agent.capacity);
        lhs.cmp(&rhs)
            .then_with(|| other.agent.weight.cmp(&self.agent.weight))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    fn apply(&mut self, transition: Option<Transition>, events: &mut Vec<LifecycleEvent>) {
        let Some((from, to)) = transition else {
            return;
        };
        self.agent.health = to;
        info!(agent = %self.agent.id, ?from, ?to, "agent health changed");
        events.push(LifecycleEvent::AgentHealthChanged {
            agent: self.agent.id.clone(),
            from,
            to,
        });
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    agents: HashMap<AgentId, AgentEntry>,
    next_seq: u64,
}

impl RegistryState {
    fn entry_mut(&mut self, id: &AgentId) -> Result<&mut AgentEntry, DispatchError> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| DispatchError::AgentNotFound(id.clone()))
    }

    fn best_for(&self, category: &Category) -> Option<AgentId> {
        self.agents
            .values()
            .filter(|entry| entry.is_eligible(category))
            .min_by(|a, b| a.compare(b))
            .map(|entry| entry.agent.id.clone())
    }

    fn assign(&mut self, id: &AgentId, task: TaskId) -> Result<(), DispatchError> {
        let entry = self.entry_mut(id)?;
        if !entry.agent.has_free_slot() {
            error!(agent = %id, task_id = %task, capacity = entry.agent.capacity, "assign over capacity");
            return Err(DispatchError::CapacityExceeded {
                agent: id.clone(),
                capacity: entry.agent.capacity,
            });
        }
        entry.agent.current_load += 1;
        entry.in_flight.insert(task);
        Ok(())
    }

    fn take_slot(&mut self, id: &AgentId, task: TaskId) -> Result<&mut AgentEntry, DispatchError> {
        let entry = self.entry_mut(id)?;
        if !entry.in_flight.remove(&task) {
            return Err(DispatchError::NotAssigned {
                agent: id.clone(),
                task,
            });
        }
        entry.agent.current_load = entry.agent.current_load.saturating_sub(1);
        entry.settle_capacity();
        Ok(entry)
    }
}

/// AgentRegistry は Agent の負荷と健全性を管理
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    config: BalancerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    /// Signalled whenever a slot may have become available.
    capacity_freed: Notify,
}

impl AgentRegistry {
    pub fn new(config: BalancerConfig, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            config,
            clock,
            events,
            capacity_freed: Notify::new(),
        }
    }

    fn emit_all(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Apply cooldown expiry and heartbeat staleness to every agent.
    fn refresh(&self, state: &mut RegistryState, events: &mut Vec<LifecycleEvent>) {
        let now = self.clock.now();
        for entry in state.agents.values_mut() {
            let transition = entry.tracker.refresh(now, &self.config);
            entry.apply(transition, events);
        }
    }

    /// Idempotent upsert. Load, statistics, health and registration order of
    /// an existing agent are kept.
    pub fn register_agent(&self, spec: AgentSpec) {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.agents.get_mut(&spec.id) {
                if spec.capacity < entry.agent.current_load {
                    warn!(
                        agent = %spec.id,
                        requested = spec.capacity,
                        load = entry.agent.current_load,
                        "capacity below current load, shrinking as tasks finish"
                    );
                }
                entry.requested_capacity = spec.capacity;
                entry.settle_capacity();
                entry.agent.capabilities = spec.capabilities;
                entry.agent.weight = spec.weight;
                info!(agent = %spec.id, capacity = spec.capacity, "agent updated");
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                info!(agent = %spec.id, capacity = spec.capacity, weight = spec.weight, "agent registered");
                let requested_capacity = spec.capacity;
                state.agents.insert(
                    spec.id.clone(),
                    AgentEntry {
                        requested_capacity,
                        agent: Agent::from_spec(spec),
                        seq,
                        in_flight: HashSet::new(),
                        tracker: HealthTracker::new(now),
                        latency_samples: 0,
                    },
                );
            }
        }
        self.capacity_freed.notify_one();
    }

    /// Remove an agent. Returns the tasks it still had in flight.
    pub fn deregister_agent(&self, id: &AgentId) -> Result<Vec<TaskId>, DispatchError> {
        let entry = self
            .state
            .lock()
            .agents
            .remove(id)
            .ok_or_else(|| DispatchError::AgentNotFound(id.clone()))?;
        let orphaned: Vec<TaskId> = entry.in_flight.into_iter().collect();
        info!(agent = %id, orphaned = orphaned.len(), "agent deregistered");
        Ok(orphaned)
    }

    /// Best agent for `category`, or `None` if nobody can take it right now.
    pub fn select_agent(&self, category: &Category) -> Option<AgentId> {
        let mut events = Vec::new();
        let selected = {
            let mut state = self.state.lock();
            self.refresh(&mut state, &mut events);
            state.best_for(category)
        };
        self.emit_all(events);
        selected
    }

    /// Take one slot on `agent` for `task`. Fails if the agent is full.
    pub fn assign(&self, agent: &AgentId, task: TaskId) -> Result<(), DispatchError> {
        self.state.lock().assign(agent, task)
    }

    /// `select_agent` + `assign` in one critical section.
    pub fn select_and_assign(&self, category: &Category, task: TaskId) -> Option<AgentId> {
        let mut events = Vec::new();
        let selected = {
            let mut state = self.state.lock();
            self.refresh(&mut state, &mut events);
            state.best_for(category).and_then(|agent| {
                let assigned = state.assign(&agent, task);
                debug_assert!(assigned.is_ok(), "selected agent had no free slot");
                assigned.ok().map(|()| agent)
            })
        };
        self.emit_all(events);
        if let Some(agent) = &selected {
            debug!(agent = %agent, task_id = %task, "agent selected");
        }
        selected
    }

    /// Give back the slot `task` held and feed its outcome into the
    /// statistics and health window.
    pub fn release(
        &self,
        agent: &AgentId,
        task: TaskId,
        duration_ms: u64,
        success: bool,
    ) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let entry = state.take_slot(agent, task)?;

            if success {
                entry.agent.total_completed += 1;
            } else {
                entry.agent.total_failed += 1;
            }

            let sample = duration_ms as f64;
            entry.agent.average_latency_ms = if entry.latency_samples == 0 {
                sample
            } else {
                let alpha = self.config.latency_alpha;
                alpha * sample + (1.0 - alpha) * entry.agent.average_latency_ms
            };
            entry.latency_samples += 1;

            let transition = entry.tracker.record(success, now, &self.config);
            entry.apply(transition, &mut events);
        }
        self.emit_all(events);
        self.capacity_freed.notify_one();
        Ok(())
    }

    /// Give back a slot without touching statistics or health (cancelled
    /// executions are not the agent's fault).
    pub fn release_cancelled(&self, agent: &AgentId, task: TaskId) -> Result<(), DispatchError> {
        self.state.lock().take_slot(agent, task)?;
        self.capacity_freed.notify_one();
        Ok(())
    }

    /// Result of an external health probe. Success restores Healthy at once.
    pub fn record_health_check(&self, agent: &AgentId, ok: bool) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(agent)?;
            let transition = entry.tracker.health_check(ok, now);
            entry.apply(transition, &mut events);
        }
        self.emit_all(events);
        if ok {
            self.capacity_freed.notify_one();
        }
        Ok(())
    }

    pub fn heartbeat(&self, agent: &AgentId) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(agent)?;
            let transition = entry.tracker.heartbeat(now);
            entry.apply(transition, &mut events);
        }
        self.emit_all(events);
        Ok(())
    }

    /// Wait until a slot may have been freed (release, registration, recovery).
    pub async fn capacity_freed(&self) {
        self.capacity_freed.notified().await;
    }

    pub fn agent(&self, id: &AgentId) -> Option<Agent> {
        let mut events = Vec::new();
        let agent = {
            let mut state = self.state.lock();
            self.refresh(&mut state, &mut events);
            state.agents.get(id).map(|entry| entry.agent.clone())
        };
        self.emit_all(events);
        agent
    }

    /// Per-agent load in registration order.
    pub fn loads(&self) -> Vec<AgentLoad> {
        let mut events = Vec::new();
        let mut entries: Vec<(u64, AgentLoad)> = {
            let mut state = self.state.lock();
            self.refresh(&mut state, &mut events);
            state
                .agents
                .values()
                .map(|entry| {
                    (
                        entry.seq,
                        AgentLoad {
                            agent: entry.agent.id.clone(),
                            load: entry.agent.current_load,
                            capacity: entry.agent.capacity,
                            health: entry.agent.health,
                        },
                    )
                })
                .collect()
        };
        self.emit_all(events);
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, load)| load).collect()
    }

    /// Union of the capabilities of every registered agent.
    pub fn categories(&self) -> BTreeSet<Category> {
        self.state
            .lock()
            .agents
            .values()
            .flat_map(|entry| entry.agent.capabilities.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
