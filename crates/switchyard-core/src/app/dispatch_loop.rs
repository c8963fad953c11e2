//! DispatchLoop - タスク配送ループ
//!
//! next -> select_and_assign -> mark_assigned -> spawn(run_task)
//!
//! run_task: mark_running -> client.execute -> release -> mark_completed /
//! mark_failed / mark_cancelled
//!
//! The loop never holds more than one component's lock at a time.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::dispatcher::{InFlight, Inner, StopReason};
use crate::domain::{AgentId, ExecutionError, Task, TaskId};
use crate::ports::RequestDescriptor;

pub(crate) async fn run(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // next() は待つ可能性があるので shutdown と競合させる
        let task = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            task = inner.queue.next() => task,
        };
        let task_id = task.id;

        let Some(agent) = inner.registry.select_and_assign(&task.category, task_id) else {
            inner
                .counters
                .no_eligible_agent
                .fetch_add(1, Ordering::Relaxed);
            debug!(task_id = %task_id, category = %task.category, "no eligible agent, requeue at front");
            if inner.queue.requeue_front(task_id).await.is_err() {
                // cancelled while we held it
                continue;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(inner.config.no_agent_backoff()) => {}
                _ = inner.registry.capacity_freed() => {}
            }
            continue;
        };

        // registered before mark_assigned so a cancel that sees Assigned can
        // always find the token
        let token = CancellationToken::new();
        inner.in_flight.lock().insert(
            task_id,
            InFlight {
                agent: agent.clone(),
                token: token.clone(),
                reason: None,
            },
        );

        let task = match inner.queue.mark_assigned(task_id, agent.clone()).await {
            Ok(task) => task,
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "task left the queue before assignment");
                inner.in_flight.lock().remove(&task_id);
                if let Err(err) = inner.registry.release_cancelled(&agent, task_id) {
                    debug!(task_id = %task_id, error = %err, "slot already gone");
                }
                continue;
            }
        };

        inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        inner
            .tracker
            .spawn(run_task(Arc::clone(&inner), task, agent, token));
    }
    debug!("dispatch loop stopped");
}

async fn run_task(inner: Arc<Inner>, task: Task, agent: AgentId, token: CancellationToken) {
    let task_id = task.id;

    if let Err(err) = inner.queue.mark_running(task_id).await {
        error!(task_id = %task_id, error = %err, "could not start assigned task");
        inner.in_flight.lock().remove(&task_id);
        if let Err(err) = inner.registry.release_cancelled(&agent, task_id) {
            debug!(task_id = %task_id, error = %err, "slot already gone");
        }
        return;
    }

    // deregistered between selection and start
    if inner.registry.agent(&agent).is_none() {
        if let Some(entry) = inner.in_flight.lock().get_mut(&task_id) {
            entry.reason.get_or_insert(StopReason::AgentLost);
        }
        token.cancel();
    }

    let request = RequestDescriptor::from(&task);
    let started = Instant::now();
    let outcome = inner.client.execute(&agent, &request, &token).await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let reason = inner
        .in_flight
        .lock()
        .remove(&task_id)
        .and_then(|entry| entry.reason);

    match (outcome, reason) {
        (Ok(value), _) => {
            release(&inner, &agent, task_id, duration_ms, true);
            if let Err(err) = inner.sink.store(task_id, &value).await {
                warn!(task_id = %task_id, error = %err, "result sink failed");
            }
            if let Err(err) = inner.queue.mark_completed(task_id, value).await {
                error!(task_id = %task_id, error = %err, "could not complete task");
            }
        }
        (Err(_), Some(StopReason::AgentLost)) => {
            // the agent is gone; nothing to release
            let lost = ExecutionError::transient(format!("agent {agent} lost"));
            if let Err(err) = inner.queue.mark_failed(task_id, &lost).await {
                error!(task_id = %task_id, error = %err, "could not requeue orphaned task");
            }
        }
        (Err(ExecutionError::Cancelled), _) => {
            if let Err(err) = inner.registry.release_cancelled(&agent, task_id) {
                debug!(task_id = %task_id, error = %err, "slot already gone");
            }
            if let Err(err) = inner.queue.mark_cancelled(task_id).await {
                error!(task_id = %task_id, error = %err, "could not cancel task");
            }
        }
        (Err(failure), _) => {
            release(&inner, &agent, task_id, duration_ms, false);
            if let Err(err) = inner.queue.mark_failed(task_id, &failure).await {
                error!(task_id = %task_id, error = %err, "could not fail task");
            }
        }
    }
}

fn release(inner: &Inner, agent: &AgentId, task_id: TaskId, duration_ms: u64, success: bool) {
    if let Err(err) = inner.registry.release(agent, task_id, duration_ms, success) {
        // agent deregistered after the execution finished
        debug!(task_id = %task_id, agent = %agent, error = %err, "release skipped");
    }
}
