//! Property tests: band ordering of the queue, load bounds of the registry.

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;

use switchyard_core::balancer::AgentRegistry;
use switchyard_core::config::{BalancerConfig, QueueConfig};
use switchyard_core::domain::{AgentId, AgentSpec, Category, Priority, TaskId, TaskPayload};
use switchyard_core::impls::NoopEventSink;
use switchyard_core::ports::{IdGenerator, SystemClock, UlidGenerator};
use switchyard_core::queue::TaskQueue;

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(Priority),
    Dequeue,
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

fn arb_queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        arb_priority().prop_map(QueueOp::Enqueue),
        Just(QueueOp::Dequeue),
    ]
}

#[derive(Debug, Clone)]
enum LoadOp {
    /// Select-and-assign on one of the categories.
    Dispatch(usize),
    /// Release the n-th (mod len) outstanding assignment.
    Release(usize, bool),
    /// Re-register agent n with a new capacity.
    Resize(usize, u32),
}

fn arb_load_op() -> impl Strategy<Value = LoadOp> {
    prop_oneof![
        4 => (0usize..2).prop_map(LoadOp::Dispatch),
        3 => (any::<usize>(), any::<bool>()).prop_map(|(i, ok)| LoadOp::Release(i, ok)),
        1 => (0usize..3, 0u32..4).prop_map(|(i, cap)| LoadOp::Resize(i, cap)),
    ]
}

const CATEGORIES: [&str; 2] = ["ocr", "draft"];

fn agent_spec(i: usize, capacity: u32) -> AgentSpec {
    AgentSpec::new(format!("agent-{i}"), capacity)
        .capability(CATEGORIES[i % 2])
        .capability("draft")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A dequeue never returns a lower band while a higher band has tasks,
    /// and each band is FIFO.
    #[test]
    fn prop_dequeue_respects_bands(ops in prop::collection::vec(arb_queue_op(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
            let queue = TaskQueue::new(
                &QueueConfig::default(),
                Arc::new(SystemClock),
                ids,
                Arc::new(NoopEventSink),
            );
            let mut model: [VecDeque<TaskId>; 3] = Default::default();

            for op in ops {
                match op {
                    QueueOp::Enqueue(priority) => {
                        let id = queue
                            .enqueue(Category::new("ocr"), priority, TaskPayload::prompt("x"))
                            .await;
                        model[priority.band()].push_back(id);
                    }
                    QueueOp::Dequeue => {
                        let expected = model.iter_mut().find_map(|band| band.pop_front());
                        let got = queue.dequeue_next().await.map(|task| task.id);
                        prop_assert_eq!(got, expected);
                    }
                }
            }
            Ok(())
        })?;
    }

    /// Whatever the interleaving of dispatches, releases and resizes,
    /// `current_load` stays within `[0, capacity]` for every agent.
    #[test]
    fn prop_load_never_exceeds_capacity(ops in prop::collection::vec(arb_load_op(), 1..80)) {
        let ids = UlidGenerator::new(SystemClock);
        let registry = AgentRegistry::new(
            BalancerConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        );
        for i in 0..3 {
            registry.register_agent(agent_spec(i, 2));
        }
        let mut outstanding: Vec<(AgentId, TaskId)> = Vec::new();

        for op in ops {
            match op {
                LoadOp::Dispatch(category) => {
                    let task = ids.generate_task_id();
                    let category = Category::new(CATEGORIES[category]);
                    if let Some(agent) = registry.select_and_assign(&category, task) {
                        outstanding.push((agent, task));
                    }
                }
                LoadOp::Release(n, success) => {
                    if !outstanding.is_empty() {
                        let (agent, task) = outstanding.remove(n % outstanding.len());
                        prop_assert!(registry.release(&agent, task, 1, success).is_ok());
                    }
                }
                LoadOp::Resize(i, capacity) => {
                    registry.register_agent(agent_spec(i, capacity));
                }
            }

            for load in registry.loads() {
                prop_assert!(load.load <= load.capacity, "{:?}", load);
            }
        }

        let held: usize = registry.loads().iter().map(|l| l.load as usize).sum();
        prop_assert_eq!(held, outstanding.len());
    }
}
