//! Component-level scenarios: queue ordering, balancer capacity and health,
//! client concurrency and caching.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use switchyard_core::balancer::AgentRegistry;
use switchyard_core::client::{BoundedClient, Fingerprint, ResultCache};
use switchyard_core::config::{BalancerConfig, CacheConfig, ClientConfig, QueueConfig};
use switchyard_core::domain::{
    AgentId, AgentSpec, Category, ExecutionError, Health, Priority, TaskPayload,
};
use switchyard_core::impls::NoopEventSink;
use switchyard_core::ports::{
    Clock, Executor, FixedClock, IdGenerator, RequestDescriptor, UlidGenerator,
};
use switchyard_core::queue::TaskQueue;

fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ))
}

fn request(text: &str) -> RequestDescriptor {
    RequestDescriptor::new(Category::new("ocr"), TaskPayload::prompt(text))
}

/// Counts invokes and echoes the request.
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for Counting {
    async fn invoke(
        &self,
        agent: &AgentId,
        request: &RequestDescriptor,
        _timeout: Duration,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "agent": agent, "request": request }))
    }
}

/// Blocks every invoke until a permit is added to `gate`.
struct Gated {
    started: AtomicUsize,
    gate: Semaphore,
}

#[async_trait]
impl Executor for Gated {
    async fn invoke(
        &self,
        _agent: &AgentId,
        request: &RequestDescriptor,
        _timeout: Duration,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|_| ExecutionError::permanent("gate closed"))?
            .forget();
        Ok(json!({ "kind": request.payload.kind() }))
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn high_band_drains_before_low_in_fifo_order() {
    let clock = fixed_clock();
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
    let queue = TaskQueue::new(
        &QueueConfig::default(),
        clock,
        ids,
        Arc::new(NoopEventSink),
    );

    let ocr = || Category::new("ocr");
    let h1 = queue.enqueue(ocr(), Priority::High, TaskPayload::prompt("h1")).await;
    let l1 = queue.enqueue(ocr(), Priority::Low, TaskPayload::prompt("l1")).await;
    let h2 = queue.enqueue(ocr(), Priority::High, TaskPayload::prompt("h2")).await;
    let l2 = queue.enqueue(ocr(), Priority::Low, TaskPayload::prompt("l2")).await;
    let h3 = queue.enqueue(ocr(), Priority::High, TaskPayload::prompt("h3")).await;

    let mut order = Vec::new();
    while let Some(task) = queue.dequeue_next().await {
        order.push(task.id);
    }
    assert_eq!(order, vec![h1, h2, h3, l1, l2]);
    assert!(queue.dequeue_next().await.is_none());
}

#[test]
fn full_agent_is_not_selected_until_released() {
    let clock = fixed_clock();
    let ids = UlidGenerator::new(clock.clone());
    let registry = AgentRegistry::new(BalancerConfig::default(), clock, Arc::new(NoopEventSink));
    registry.register_agent(AgentSpec::new("solo", 1).capability("ocr"));

    let ocr = Category::new("ocr");
    let first = ids.generate_task_id();
    let second = ids.generate_task_id();

    let agent = registry.select_and_assign(&ocr, first).unwrap();
    assert_eq!(agent, AgentId::new("solo"));
    assert_eq!(registry.select_agent(&ocr), None);
    assert_eq!(registry.select_and_assign(&ocr, second), None);

    registry.release(&agent, first, 12, true).unwrap();
    assert_eq!(registry.select_and_assign(&ocr, second), Some(agent));
}

#[test]
fn failing_agent_is_excluded_until_cooldown_and_a_success() {
    let clock = fixed_clock();
    let ids = UlidGenerator::new(clock.clone());
    let config = BalancerConfig::default();
    let cooldown = config.cooldown();
    let registry = AgentRegistry::new(config, clock.clone(), Arc::new(NoopEventSink));
    registry.register_agent(AgentSpec::new("flaky", 10).capability("ocr"));
    let agent = AgentId::new("flaky");
    let ocr = Category::new("ocr");

    // 4 successes then 6 failures: 6 of the last 10 releases failed
    let outcomes = [true, true, true, true, false, false, false, false, false, false];
    for success in outcomes {
        let task = ids.generate_task_id();
        registry.assign(&agent, task).unwrap();
        registry.release(&agent, task, 5, success).unwrap();
    }
    assert_eq!(registry.agent(&agent).unwrap().health, Health::Unhealthy);
    assert_eq!(registry.select_agent(&ocr), None);

    clock.advance(cooldown - Duration::from_secs(1));
    assert_eq!(registry.select_agent(&ocr), None);

    clock.advance(Duration::from_secs(1));
    let task = ids.generate_task_id();
    assert_eq!(registry.select_and_assign(&ocr, task), Some(agent.clone()));
    assert_eq!(registry.agent(&agent).unwrap().health, Health::Recovering);

    registry.release(&agent, task, 5, true).unwrap();
    let snapshot = registry.agent(&agent).unwrap();
    assert_eq!(snapshot.health, Health::Healthy);
    assert_eq!(snapshot.current_load, 0);
    assert_eq!(registry.select_agent(&ocr), Some(agent));
}

#[tokio::test]
async fn single_slot_client_runs_one_invoke_at_a_time() {
    let executor = Arc::new(Gated {
        started: AtomicUsize::new(0),
        gate: Semaphore::new(0),
    });
    let config = ClientConfig {
        concurrency: 1,
        ..ClientConfig::default()
    };
    let client = Arc::new(BoundedClient::new(&config, executor.clone(), fixed_clock()));
    let agent = AgentId::new("vision-1");

    let spawn_execute = |text: &'static str| {
        let client = Arc::clone(&client);
        let agent = agent.clone();
        tokio::spawn(async move {
            client
                .execute(&agent, &request(text), &CancellationToken::new())
                .await
        })
    };
    let first = spawn_execute("first");
    let second = spawn_execute("second");

    wait_until(|| executor.started.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.started.load(Ordering::SeqCst), 1);
    assert_eq!(client.available_slots(), 0);

    executor.gate.add_permits(1);
    wait_until(|| executor.started.load(Ordering::SeqCst) == 2).await;
    executor.gate.add_permits(1);

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(client.available_slots(), 1);
}

#[tokio::test]
async fn identical_requests_within_ttl_invoke_once() {
    let executor = Arc::new(Counting::default());
    let client = BoundedClient::new(&ClientConfig::default(), executor.clone(), fixed_clock());
    let agent = AgentId::new("vision-1");
    let cancel = CancellationToken::new();

    let first = client.execute(&agent, &request("scan"), &cancel).await.unwrap();
    let second = client.execute(&agent, &request("scan"), &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let stats = client.stats();
    assert_eq!(stats.invocations, 1);
    assert_eq!(stats.cache.hits, 1);
}

#[tokio::test]
async fn expired_entry_is_fetched_again() {
    let executor = Arc::new(Counting::default());
    let clock = fixed_clock();
    let config = ClientConfig {
        cache: CacheConfig {
            ttl_secs: 60,
            ..CacheConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = BoundedClient::new(&config, executor.clone(), clock.clone());
    let agent = AgentId::new("vision-1");
    let cancel = CancellationToken::new();

    client.execute(&agent, &request("scan"), &cancel).await.unwrap();
    clock.advance(Duration::from_secs(61));
    client.execute(&agent, &request("scan"), &cancel).await.unwrap();

    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn overflow_evicts_exactly_the_first_inserted_key() {
    let clock: Arc<dyn Clock> = fixed_clock();
    let config = CacheConfig {
        capacity: 3,
        ..CacheConfig::default()
    };
    let cache = ResultCache::new(&config, clock);
    let agent = AgentId::new("vision-1");
    let keys: Vec<Fingerprint> = ["a", "b", "c", "d"]
        .iter()
        .map(|text| Fingerprint::of(&agent, &request(text)))
        .collect();

    for (i, key) in keys.iter().enumerate() {
        cache.insert(key.clone(), json!(i));
    }

    assert_eq!(cache.len(), 3);
    assert_eq!(cache.peek(&keys[0]), None);
    for (i, key) in keys.iter().enumerate().skip(1) {
        assert_eq!(cache.peek(key), Some(json!(i)));
    }
}
