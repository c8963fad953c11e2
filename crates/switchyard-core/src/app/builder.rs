//! DispatcherBuilder - ディスパッチャの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_categories() で期待されるカテゴリを登録
//! - build() 時に「期待集合 ⊆ 登録済みエージェントの能力集合」をチェック
//! - 不足があれば BuildError を返す

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::task::TaskTracker;

use super::dispatcher::{Counters, Dispatcher, Inner};
use crate::balancer::AgentRegistry;
use crate::bus::MessageBus;
use crate::client::BoundedClient;
use crate::config::{ConfigError, SwitchyardConfig};
use crate::domain::{AgentId, AgentSpec, Category};
use crate::impls::{BroadcastEventSink, NoopResultSink};
use crate::ports::{Clock, EventSink, Executor, IdGenerator, MessageHandler, ResultSink, SystemClock, UlidGenerator};
use crate::queue::TaskQueue;

/// BuildError はディスパッチャ構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing categories: {0:?}. These categories were expected but no registered agent handles them.")]
    MissingCategories(Vec<String>),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// # 使用例
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(executor)
///     .config(config)
///     .agent(AgentSpec::new("vision-1", 4).capability("ocr"))
///     .expect_categories(&["ocr"])
///     .build()?;
/// let handle = dispatcher.spawn();
/// ```
pub struct DispatcherBuilder {
    executor: Arc<dyn Executor>,
    config: SwitchyardConfig,
    agents: Vec<AgentSpec>,
    result_sink: Option<Arc<dyn ResultSink>>,
    clock: Option<Arc<dyn Clock>>,
    subscribers: Vec<(AgentId, Arc<dyn MessageHandler>)>,
    expected_categories: Option<Vec<String>>,
}

impl DispatcherBuilder {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            config: SwitchyardConfig::default(),
            agents: Vec::new(),
            result_sink: None,
            clock: None,
            subscribers: Vec::new(),
            expected_categories: None,
        }
    }

    pub fn config(mut self, config: SwitchyardConfig) -> Self {
        self.config = config;
        self
    }

    /// Agent registered before the dispatcher starts.
    pub fn agent(mut self, spec: AgentSpec) -> Self {
        self.agents.push(spec);
        self
    }

    /// Defaults to `NoopResultSink`.
    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.result_sink = Some(sink);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn subscriber(mut self, agent: impl Into<AgentId>, handler: Arc<dyn MessageHandler>) -> Self {
        self.subscribers.push((agent.into(), handler));
        self
    }

    /// `build` fails unless every listed category has a registered agent.
    /// A task whose category nobody serves blocks its band and every band
    /// below it.
    pub fn expect_categories(mut self, categories: &[&str]) -> Self {
        self.expected_categories = Some(categories.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_categories {
            let covered: Vec<&Category> = self
                .agents
                .iter()
                .flat_map(|spec| spec.capabilities.iter())
                .collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|category| !covered.iter().any(|c| c.as_str() == category.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingCategories(missing));
            }
        }

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let events = Arc::new(BroadcastEventSink::new(config.dispatcher.event_buffer));
        let event_sink: Arc<dyn EventSink> = events.clone();

        let queue = TaskQueue::new(
            &config.queue,
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&event_sink),
        );
        let registry = AgentRegistry::new(
            config.balancer.clone(),
            Arc::clone(&clock),
            Arc::clone(&event_sink),
        );
        for spec in self.agents {
            registry.register_agent(spec);
        }
        let client = BoundedClient::new(&config.client, self.executor, Arc::clone(&clock));
        let bus = MessageBus::new(&config.bus, Arc::clone(&clock), ids);
        for (agent, handler) in self.subscribers {
            bus.subscribe(agent, handler);
        }

        Ok(Dispatcher::from_inner(Inner {
            queue,
            registry,
            client,
            bus,
            sink: self
                .result_sink
                .unwrap_or_else(|| Arc::new(NoopResultSink)),
            events,
            config: config.dispatcher,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            tracker: TaskTracker::new(),
        }))
    }
}
