//! Dispatcher - 制御面（Enqueue / Cancel / GetStatus / RegisterAgent / Send）
//!
//! Owns one instance of every component and passes it explicitly to the
//! loops; there is no global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::status::DispatchStatus;
use super::{delivery_loop, dispatch_loop};
use crate::balancer::AgentRegistry;
use crate::bus::MessageBus;
use crate::client::BoundedClient;
use crate::config::DispatcherConfig;
use crate::domain::{
    Agent, AgentId, AgentSpec, Category, DispatchError, LifecycleEvent, MessageId,
    MessagePayload, Priority, Recipient, Task, TaskId, TaskPayload,
};
use crate::impls::BroadcastEventSink;
use crate::ports::{MessageHandler, ResultSink};
use crate::queue::{CancelOutcome, TaskQueue};

/// Why an in-flight execution was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Cancelled,
    AgentLost,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub agent: AgentId,
    pub token: CancellationToken,
    pub reason: Option<StopReason>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub dispatched: AtomicU64,
    pub no_eligible_agent: AtomicU64,
}

pub(crate) struct Inner {
    pub queue: TaskQueue,
    pub registry: AgentRegistry,
    pub client: BoundedClient,
    pub bus: MessageBus,
    pub sink: Arc<dyn ResultSink>,
    pub events: Arc<BroadcastEventSink>,
    pub config: DispatcherConfig,
    pub in_flight: Mutex<HashMap<TaskId, InFlight>>,
    pub counters: Counters,
    pub tracker: TaskTracker,
}

impl Inner {
    /// Signal every in-flight task matching `filter`.
    fn stop_where(&self, reason: StopReason, filter: impl Fn(&TaskId, &InFlight) -> bool) -> usize {
        let mut in_flight = self.in_flight.lock();
        let mut stopped = 0;
        for (task_id, entry) in in_flight.iter_mut() {
            if filter(task_id, entry) {
                entry.reason.get_or_insert(reason);
                entry.token.cancel();
                stopped += 1;
            }
        }
        stopped
    }
}

/// Dispatcher はタスクキュー・ロードバランサ・クライアント・メッセージバスを束ねる
///
/// Cheap to clone; every clone talks to the same components.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Submit a task. Always succeeds; the outcome is observed through
    /// `task`, `status` or the event stream.
    ///
    /// Bands are strict: while the head of a higher band has no eligible
    /// agent, lower bands wait even if their agents are idle. Register an
    /// agent for every category in use (see `expect_categories`).
    pub async fn enqueue(
        &self,
        category: impl Into<Category>,
        priority: Priority,
        payload: TaskPayload,
    ) -> TaskId {
        self.inner
            .queue
            .enqueue(category.into(), priority, payload)
            .await
    }

    pub async fn enqueue_with_deadline(
        &self,
        category: impl Into<Category>,
        priority: Priority,
        payload: TaskPayload,
        deadline: DateTime<Utc>,
    ) -> TaskId {
        self.inner
            .queue
            .enqueue_with_deadline(category.into(), priority, payload, deadline)
            .await
    }

    /// Cancel a task.
    ///
    /// A queued task is removed at once. A running one is signalled and
    /// becomes `Cancelled` when its execution observes the signal (before its
    /// next retry at the latest); if the execution completes first, the
    /// result wins.
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, DispatchError> {
        let outcome = self.inner.queue.cancel(task_id).await?;
        if let CancelOutcome::InFlight { .. } = outcome {
            let signalled = self
                .inner
                .stop_where(StopReason::Cancelled, |id, _| *id == task_id);
            debug!(task_id = %task_id, signalled, "cancel requested for in-flight task");
        }
        Ok(outcome)
    }

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.queue.task(task_id).await
    }

    pub async fn status(&self) -> DispatchStatus {
        let inner = &self.inner;
        let client = inner.client.stats();
        DispatchStatus {
            queue_depths: inner.queue.depths().await,
            task_counts: inner.queue.counts_by_state().await,
            agent_loads: inner.registry.loads(),
            cache_hit_rate: client.cache.hit_rate,
            in_flight: inner.in_flight.lock().len(),
            dispatched: inner.counters.dispatched.load(Ordering::Relaxed),
            no_eligible_agent: inner.counters.no_eligible_agent.load(Ordering::Relaxed),
            client,
            messages: inner.bus.counts().await,
        }
    }

    pub fn register_agent(&self, spec: AgentSpec) {
        self.inner.registry.register_agent(spec);
    }

    /// Remove an agent. Its in-flight tasks are stopped and go back to the
    /// queue as transient failures, to be retried on another agent.
    pub fn deregister_agent(&self, agent: &AgentId) -> Result<Vec<TaskId>, DispatchError> {
        let orphaned = self.inner.registry.deregister_agent(agent)?;
        let stopped = self
            .inner
            .stop_where(StopReason::AgentLost, |_, entry| entry.agent == *agent);
        info!(agent = %agent, orphaned = orphaned.len(), stopped, "agent lost");
        Ok(orphaned)
    }

    pub fn agent(&self, agent: &AgentId) -> Option<Agent> {
        self.inner.registry.agent(agent)
    }

    pub fn record_health_check(&self, agent: &AgentId, ok: bool) -> Result<(), DispatchError> {
        self.inner.registry.record_health_check(agent, ok)
    }

    pub fn heartbeat(&self, agent: &AgentId) -> Result<(), DispatchError> {
        self.inner.registry.heartbeat(agent)
    }

    pub async fn send(
        &self,
        from: AgentId,
        to: Recipient,
        priority: i32,
        payload: MessagePayload,
    ) -> MessageId {
        self.inner.bus.send(from, to, priority, payload).await
    }

    pub fn subscribe(&self, agent: AgentId, handler: Arc<dyn MessageHandler>) {
        self.inner.bus.subscribe(agent, handler);
    }

    pub fn unsubscribe(&self, agent: &AgentId) -> bool {
        self.inner.bus.unsubscribe(agent)
    }

    pub async fn message(&self, id: MessageId) -> Option<crate::domain::Message> {
        self.inner.bus.message(id).await
    }

    /// Lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn client(&self) -> &BoundedClient {
        &self.inner.client
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Start the dispatch loop and the message delivery loop.
    pub fn spawn(&self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = vec![
            tokio::spawn(dispatch_loop::run(
                Arc::clone(&self.inner),
                shutdown_rx.clone(),
            )),
            tokio::spawn(delivery_loop::run(Arc::clone(&self.inner), shutdown_rx)),
        ];

        DispatcherHandle {
            shutdown_tx,
            joins,
            tracker: self.inner.tracker.clone(),
        }
    }
}

/// Handle to the running loops.
/// - `request_shutdown()` で新しいタスクの取得を止める
/// - `shutdown_and_join()` で in-flight の実行も含めて終了を待つ
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    tracker: TaskTracker,
}

impl DispatcherHandle {
    /// Stop taking new tasks and messages. In-flight executions keep running.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the loops and every in-flight execution.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}
