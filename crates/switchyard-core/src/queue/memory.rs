//! In-memory task queue: three strict priority bands plus lifecycle tracking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::{CancelOutcome, FailureDisposition, QueueCounts, QueueDepths, TaskRecord};
use crate::config::QueueConfig;
use crate::domain::{
    AgentId, Category, DispatchError, ErrorKind, ExecutionError, LifecycleEvent, Priority, Task,
    TaskId, TaskPayload, TaskState,
};
use crate::ports::{Clock, EventSink, IdGenerator};

/// Lifetime totals of terminal tasks (the archive itself is bounded).
#[derive(Debug, Default)]
struct Totals {
    completed: usize,
    failed: usize,
    cancelled: usize,
}

struct QueueState {
    /// Active (non-terminal) tasks.
    records: HashMap<TaskId, TaskRecord>,

    /// One FIFO per priority band, indexed by `Priority::band`.
    bands: [VecDeque<TaskId>; 3],

    /// Queued tasks handed out by `dequeue_next` and not yet assigned or
    /// pushed back.
    popped: HashSet<TaskId>,

    archive: VecDeque<Task>,
    archive_capacity: usize,
    totals: Totals,
}

impl QueueState {
    fn new(archive_capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            bands: Default::default(),
            popped: HashSet::new(),
            archive: VecDeque::new(),
            archive_capacity,
            totals: Totals::default(),
        }
    }

    fn record_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, DispatchError> {
        self.records
            .get_mut(&id)
            .ok_or(DispatchError::TaskNotFound(id))
    }

    /// Pop the head of the highest non-empty band, failing expired tasks on
    /// the way.
    fn pop_ready(&mut self, now: DateTime<Utc>, events: &mut Vec<LifecycleEvent>) -> Option<Task> {
        for band in 0..self.bands.len() {
            while let Some(id) = self.bands[band].pop_front() {
                let Some(record) = self.records.get_mut(&id) else {
                    continue;
                };
                if record.state() != TaskState::Queued {
                    continue;
                }
                if record.task.is_expired(now) {
                    if record.expire(now).is_ok() {
                        events.push(LifecycleEvent::TaskFailed {
                            task_id: id,
                            error: "deadline exceeded".to_string(),
                            attempt: record.task.attempt,
                            terminal: true,
                        });
                        warn!(task_id = %id, "deadline exceeded before dispatch");
                        self.archive(id);
                    }
                    continue;
                }
                let task = record.task.clone();
                self.popped.insert(id);
                return Some(task);
            }
        }
        None
    }

    /// Move a terminal task from the active map into the archive.
    fn archive(&mut self, id: TaskId) -> Option<Task> {
        let record = self.records.remove(&id)?;
        self.popped.remove(&id);
        match record.state() {
            TaskState::Completed => self.totals.completed += 1,
            TaskState::Failed => self.totals.failed += 1,
            TaskState::Cancelled => self.totals.cancelled += 1,
            _ => {}
        }
        let task = record.task;
        if self.archive_capacity > 0 {
            if self.archive.len() == self.archive_capacity {
                self.archive.pop_front();
            }
            self.archive.push_back(task.clone());
        }
        Some(task)
    }

    fn depths(&self) -> QueueDepths {
        QueueDepths {
            high: self.bands[Priority::High.band()].len(),
            normal: self.bands[Priority::Normal.band()].len(),
            low: self.bands[Priority::Low.band()].len(),
        }
    }

    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            completed: self.totals.completed,
            failed: self.totals.failed,
            cancelled: self.totals.cancelled,
            ..QueueCounts::default()
        };
        for record in self.records.values() {
            match record.state() {
                TaskState::Queued => counts.queued += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Running => counts.running += 1,
                // Terminal records are archived as soon as they are reached.
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {}
            }
        }
        counts
    }
}

/// TaskQueue は優先度付きのタスクキュー
///
/// - `High` fully drains before `Normal` is considered, `Normal` before `Low`
/// - FIFO within a band
/// - failed tasks go back to the *tail* of their band while retries remain
///
/// Lifecycle events are emitted after the lock is released.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_retries: u32,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl TaskQueue {
    pub fn new(
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::new(config.archive_capacity)),
            notify: Notify::new(),
            max_retries: config.max_retries,
            clock,
            ids,
            events,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn emit_all(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Place a new task at the tail of its band. Always succeeds.
    pub async fn enqueue(
        &self,
        category: Category,
        priority: Priority,
        payload: TaskPayload,
    ) -> TaskId {
        self.push_new(category, priority, payload, None).await
    }

    /// Like `enqueue`, but the task is failed instead of dispatched if it is
    /// still queued after `deadline`.
    pub async fn enqueue_with_deadline(
        &self,
        category: Category,
        priority: Priority,
        payload: TaskPayload,
        deadline: DateTime<Utc>,
    ) -> TaskId {
        self.push_new(category, priority, payload, Some(deadline))
            .await
    }

    async fn push_new(
        &self,
        category: Category,
        priority: Priority,
        payload: TaskPayload,
        deadline: Option<DateTime<Utc>>,
    ) -> TaskId {
        let id = self.ids.generate_task_id();
        let mut task = Task::new(id, category.clone(), priority, payload, self.clock.now());
        if let Some(deadline) = deadline {
            task = task.with_deadline(deadline);
        }

        {
            let mut state = self.state.lock().await;
            state.records.insert(id, TaskRecord::new(task));
            state.bands[priority.band()].push_back(id);
        }

        debug!(task_id = %id, category = %category, priority = %priority, "task queued");
        self.events.emit(LifecycleEvent::TaskQueued {
            task_id: id,
            category,
            priority,
        });
        self.notify.notify_one();
        id
    }

    /// Head of the highest non-empty band, or `None` when every band is empty.
    ///
    /// The returned task stays `Queued` until it is assigned or pushed back
    /// with `requeue_front`.
    pub async fn dequeue_next(&self) -> Option<Task> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let task = {
            let mut state = self.state.lock().await;
            state.pop_ready(now, &mut events)
        };
        self.emit_all(events);
        task
    }

    /// Wait until a task is available and pop it.
    pub async fn next(&self) -> Task {
        loop {
            if let Some(task) = self.dequeue_next().await {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Put a popped task back at the *front* of its band (no agent could take it).
    pub async fn requeue_front(&self, id: TaskId) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        if record.state() != TaskState::Queued {
            return Err(DispatchError::InvalidTransition {
                task: id,
                from: record.state(),
                to: TaskState::Queued,
            });
        }
        let band = record.task.priority.band();
        if state.popped.remove(&id) {
            state.bands[band].push_front(id);
        }
        Ok(())
    }

    pub async fn mark_assigned(&self, id: TaskId, agent: AgentId) -> Result<Task, DispatchError> {
        let now = self.clock.now();
        let task = {
            let mut state = self.state.lock().await;
            let record = state.record_mut(id)?;
            record.assign(agent.clone(), now)?;
            let task = record.task.clone();
            state.popped.remove(&id);
            task
        };
        debug!(task_id = %id, agent = %agent, "task assigned");
        self.events
            .emit(LifecycleEvent::TaskAssigned { task_id: id, agent });
        Ok(task)
    }

    pub async fn mark_running(&self, id: TaskId) -> Result<Task, DispatchError> {
        let now = self.clock.now();
        let task = {
            let mut state = self.state.lock().await;
            let record = state.record_mut(id)?;
            record.start(now)?;
            record.task.clone()
        };
        if let Some(agent) = task.assigned_agent.clone() {
            debug!(task_id = %id, agent = %agent, "task running");
            self.events
                .emit(LifecycleEvent::TaskStarted { task_id: id, agent });
        }
        Ok(task)
    }

    pub async fn mark_completed(
        &self,
        id: TaskId,
        result: serde_json::Value,
    ) -> Result<Task, DispatchError> {
        let now = self.clock.now();
        let (task, agent) = {
            let mut state = self.state.lock().await;
            let agent = state.record_mut(id)?.complete(result, now)?;
            let task = state.archive(id).ok_or(DispatchError::TaskNotFound(id))?;
            (task, agent)
        };
        debug!(task_id = %id, "task completed");
        self.events
            .emit(LifecycleEvent::TaskCompleted { task_id: id, agent });
        Ok(task)
    }

    /// Record a failed attempt.
    ///
    /// Non-permanent failures go back to the tail of the original band while
    /// `attempt < max_retries` (checked before the attempt is counted), so a
    /// task is dispatched at most `max_retries + 1` times. Everything else is
    /// terminal.
    pub async fn mark_failed(
        &self,
        id: TaskId,
        error: &ExecutionError,
    ) -> Result<FailureDisposition, DispatchError> {
        let now = self.clock.now();
        let message = error.to_string();
        let (disposition, attempt) = {
            let mut state = self.state.lock().await;
            let record = state.record_mut(id)?;
            let previous_attempts = record.task.attempt;
            record.fail(message.clone(), now)?;
            let attempt = record.task.attempt;

            if error.kind() == ErrorKind::Transient && previous_attempts < self.max_retries {
                record.requeue(now)?;
                let band = record.task.priority.band();
                state.bands[band].push_back(id);
                (FailureDisposition::Requeued { attempt }, attempt)
            } else {
                state.archive(id);
                (FailureDisposition::Failed, attempt)
            }
        };

        let terminal = disposition == FailureDisposition::Failed;
        if terminal {
            warn!(task_id = %id, attempt, error = %message, "task failed");
        } else {
            warn!(task_id = %id, attempt, error = %message, "task requeued after failure");
        }
        self.events.emit(LifecycleEvent::TaskFailed {
            task_id: id,
            error: message,
            attempt,
            terminal,
        });
        if !terminal {
            self.notify.notify_one();
        }
        Ok(disposition)
    }

    /// Cancel a task that is not in flight, or report where it is.
    ///
    /// Queued tasks are removed from their band immediately; for Assigned /
    /// Running tasks the caller must signal the in-flight execution and then
    /// call `mark_cancelled`.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, DispatchError> {
        let now = self.clock.now();
        let outcome = {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get_mut(&id) else {
                return state
                    .archive
                    .iter()
                    .rev()
                    .find(|t| t.id == id)
                    .map(|t| CancelOutcome::AlreadyTerminal(t.state))
                    .ok_or(DispatchError::TaskNotFound(id));
            };
            match record.state() {
                TaskState::Queued => {
                    record.cancel(now)?;
                    let band = record.task.priority.band();
                    state.bands[band].retain(|queued| *queued != id);
                    state.archive(id);
                    CancelOutcome::Removed
                }
                TaskState::Assigned | TaskState::Running => CancelOutcome::InFlight {
                    agent: record.task.assigned_agent.clone(),
                },
                terminal => CancelOutcome::AlreadyTerminal(terminal),
            }
        };
        if outcome == CancelOutcome::Removed {
            debug!(task_id = %id, "queued task cancelled");
            self.events.emit(LifecycleEvent::TaskCancelled { task_id: id });
        }
        Ok(outcome)
    }

    /// Assigned | Running -> Cancelled, once the in-flight execution stopped.
    pub async fn mark_cancelled(&self, id: TaskId) -> Result<Task, DispatchError> {
        let now = self.clock.now();
        let task = {
            let mut state = self.state.lock().await;
            state.record_mut(id)?.cancel(now)?;
            state.archive(id).ok_or(DispatchError::TaskNotFound(id))?
        };
        debug!(task_id = %id, "in-flight task cancelled");
        self.events.emit(LifecycleEvent::TaskCancelled { task_id: id });
        Ok(task)
    }

    /// Snapshot of an active or archived task.
    pub async fn task(&self, id: TaskId) -> Option<Task> {
        let state = self.state.lock().await;
        if let Some(record) = state.records.get(&id) {
            return Some(record.task.clone());
        }
        state.archive.iter().rev().find(|t| t.id == id).cloned()
    }

    pub async fn depths(&self) -> QueueDepths {
        self.state.lock().await.depths()
    }

    pub async fn counts_by_state(&self) -> QueueCounts {
        self.state.lock().await.counts_by_state()
    }
}
