//! MessageBus - 優先度付きメッセージ配送
//!
//! Out-of-band control / collaboration traffic. Messages are popped highest
//! numeric priority first (FIFO among equal priorities) and handed to the
//! subscribed `MessageHandler` of every recipient. Delivery failures are
//! retried with the bus's own `RetryPolicy`; the bounded client's slots are
//! never used.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::domain::{
    AgentId, DeliveryState, ExecutionError, Message, MessageId, MessagePayload, Recipient,
};
use crate::ports::{Clock, IdGenerator, MessageHandler};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    priority: i32,
    seq: u64,
    id: MessageId,
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority first, then older first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BusState {
    heap: BinaryHeap<Pending>,
    /// Messages not yet processed by `deliver`.
    messages: HashMap<MessageId, Message>,
    next_seq: u64,

    archive: VecDeque<Message>,
    archive_capacity: usize,
    delivered: usize,
    failed: usize,
}

impl BusState {
    fn new(archive_capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            messages: HashMap::new(),
            next_seq: 0,
            archive: VecDeque::new(),
            archive_capacity,
            delivered: 0,
            failed: 0,
        }
    }

    /// Move a processed message into the archive.
    fn archive(&mut self, message: Message) {
        match message.state {
            DeliveryState::Delivered => self.delivered += 1,
            DeliveryState::Failed => self.failed += 1,
            DeliveryState::Pending => {}
        }
        if self.archive_capacity > 0 {
            if self.archive.len() == self.archive_capacity {
                self.archive.pop_front();
            }
            self.archive.push_back(message);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct MessageBus {
    state: Mutex<BusState>,
    notify: Notify,
    subscribers: RwLock<HashMap<AgentId, Arc<dyn MessageHandler>>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MessageBus {
    pub fn new(config: &BusConfig, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(BusState::new(config.archive_capacity)),
            notify: Notify::new(),
            subscribers: RwLock::new(HashMap::new()),
            retry: config.retry.policy(),
            clock,
            ids,
        }
    }

    /// Register the delivery callback for `agent`, replacing any previous one.
    pub fn subscribe(&self, agent: AgentId, handler: Arc<dyn MessageHandler>) {
        debug!(agent = %agent, "bus subscriber added");
        self.subscribers.write().insert(agent, handler);
    }

    pub fn unsubscribe(&self, agent: &AgentId) -> bool {
        self.subscribers.write().remove(agent).is_some()
    }

    /// Queue a message for delivery.
    pub async fn send(
        &self,
        from: AgentId,
        to: Recipient,
        priority: i32,
        payload: MessagePayload,
    ) -> MessageId {
        let id = self.ids.generate_message_id();
        let message = Message::new(id, from, to, priority, payload, self.clock.now());
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Pending { priority, seq, id });
            state.messages.insert(id, message);
        }
        debug!(message_id = %id, priority, "message queued");
        self.notify.notify_one();
        id
    }

    /// Highest-priority pending message, if any.
    pub async fn next_pending(&self) -> Option<Message> {
        let mut state = self.state.lock().await;
        while let Some(pending) = state.heap.pop() {
            if let Some(message) = state.messages.get(&pending.id) {
                return Some(message.clone());
            }
        }
        None
    }

    /// Wait for the next pending message.
    pub async fn next(&self) -> Message {
        loop {
            if let Some(message) = self.next_pending().await {
                return message;
            }
            self.notify.notified().await;
        }
    }

    fn recipients(&self, message: &Message) -> Vec<(AgentId, Option<Arc<dyn MessageHandler>>)> {
        let subscribers = self.subscribers.read();
        match &message.to {
            Recipient::Agent(agent) => vec![(agent.clone(), subscribers.get(agent).cloned())],
            Recipient::Broadcast => subscribers
                .iter()
                .filter(|(agent, _)| **agent != message.from)
                .map(|(agent, handler)| (agent.clone(), Some(Arc::clone(handler))))
                .collect(),
        }
    }

    /// Hand `message` to every recipient and record the outcome.
    ///
    /// `delivered` is set only when every recipient accepted the message.
    pub async fn deliver(&self, message: Message) -> DeliveryState {
        let mut attempts = 0;
        let mut last_error = None;

        for (recipient, handler) in self.recipients(&message) {
            let Some(handler) = handler else {
                last_error = Some(format!("no subscriber for {recipient}"));
                continue;
            };
            let (tries, result) = self.deliver_to(&recipient, handler.as_ref(), &message).await;
            attempts += tries;
            if let Err(err) = result {
                warn!(message_id = %message.id, recipient = %recipient, error = %err, "delivery failed");
                last_error = Some(err.to_string());
            }
        }

        let outcome = if last_error.is_none() {
            DeliveryState::Delivered
        } else {
            DeliveryState::Failed
        };

        let mut state = self.state.lock().await;
        if let Some(mut stored) = state.messages.remove(&message.id) {
            stored.attempts += attempts;
            stored.state = outcome;
            stored.delivered = outcome == DeliveryState::Delivered;
            stored.last_error = last_error;
            state.archive(stored);
        }
        debug!(message_id = %message.id, ?outcome, attempts, "message processed");
        outcome
    }

    async fn deliver_to(
        &self,
        recipient: &AgentId,
        handler: &dyn MessageHandler,
        message: &Message,
    ) -> (u32, Result<(), ExecutionError>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.deliver(recipient, message).await {
                Ok(()) => return (attempt, Ok(())),
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    debug!(
                        message_id = %message.id,
                        recipient = %recipient,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "delivery retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (attempt, Err(err)),
            }
        }
    }

    /// Pending or archived message. Processed messages older than the
    /// archive window are gone.
    pub async fn message(&self, id: MessageId) -> Option<Message> {
        let state = self.state.lock().await;
        state
            .messages
            .get(&id)
            .or_else(|| state.archive.iter().rev().find(|m| m.id == id))
            .cloned()
    }

    /// Pending messages plus lifetime delivered / failed totals.
    pub async fn counts(&self) -> MessageCounts {
        let state = self.state.lock().await;
        MessageCounts {
            pending: state.messages.len(),
            delivered: state.delivered,
            failed: state.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::config::RetryConfig;
    use crate::ports::{SystemClock, UlidGenerator};

    /// Records deliveries; fails the first `failures` calls transiently.
    #[derive(Default)]
    struct Inbox {
        received: SyncMutex<Vec<(AgentId, MessageId)>>,
        failures: SyncMutex<u32>,
        permanent: bool,
    }

    impl Inbox {
        fn flaky(failures: u32) -> Self {
            Self {
                failures: SyncMutex::new(failures),
                ..Self::default()
            }
        }

        fn broken() -> Self {
            Self {
                permanent: true,
                ..Self::default()
            }
        }

        fn received(&self) -> Vec<(AgentId, MessageId)> {
            self.received.lock().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Inbox {
        async fn deliver(
            &self,
            recipient: &AgentId,
            message: &Message,
        ) -> Result<(), ExecutionError> {
            if self.permanent {
                return Err(ExecutionError::permanent("rejected"));
            }
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ExecutionError::transient("busy"));
                }
            }
            self.received.lock().push((recipient.clone(), message.id));
            Ok(())
        }
    }

    fn bus_with_archive(archive_capacity: usize) -> MessageBus {
        let config = BusConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 1_000,
            },
            archive_capacity,
        };
        MessageBus::new(
            &config,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    fn bus() -> MessageBus {
        bus_with_archive(64)
    }

    fn control(command: &str) -> MessagePayload {
        MessagePayload::Control {
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn higher_priority_first_fifo_within_priority() {
        let bus = bus();
        let from = AgentId::new("dispatcher");
        let to = Recipient::Agent(AgentId::new("a1"));
        let low = bus.send(from.clone(), to.clone(), 1, control("low")).await;
        let high_1 = bus.send(from.clone(), to.clone(), 9, control("h1")).await;
        let high_2 = bus.send(from.clone(), to.clone(), 9, control("h2")).await;

        let order: Vec<MessageId> = [
            bus.next_pending().await,
            bus.next_pending().await,
            bus.next_pending().await,
        ]
        .into_iter()
        .map(|m| m.unwrap().id)
        .collect();

        assert_eq!(order, vec![high_1, high_2, low]);
        assert!(bus.next_pending().await.is_none());
    }

    #[tokio::test]
    async fn direct_delivery_marks_delivered() {
        let bus = bus();
        let inbox = Arc::new(Inbox::default());
        bus.subscribe(AgentId::new("a1"), inbox.clone());

        let id = bus
            .send(
                AgentId::new("dispatcher"),
                Recipient::Agent(AgentId::new("a1")),
                0,
                control("drain"),
            )
            .await;
        assert!(!bus.message(id).await.unwrap().delivered());

        let message = bus.next().await;
        assert_eq!(bus.deliver(message).await, DeliveryState::Delivered);

        let stored = bus.message(id).await.unwrap();
        assert!(stored.delivered());
        assert_eq!(stored.attempts(), 1);
        assert_eq!(inbox.received(), vec![(AgentId::new("a1"), id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_delivery_failures_are_retried() {
        let bus = bus();
        bus.subscribe(AgentId::new("a1"), Arc::new(Inbox::flaky(2)));

        let id = bus
            .send(
                AgentId::new("dispatcher"),
                Recipient::Agent(AgentId::new("a1")),
                0,
                control("x"),
            )
            .await;
        let message = bus.next_pending().await.unwrap();

        assert_eq!(bus.deliver(message).await, DeliveryState::Delivered);
        assert_eq!(bus.message(id).await.unwrap().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_gives_up_after_retry_budget() {
        let bus = bus();
        bus.subscribe(AgentId::new("a1"), Arc::new(Inbox::flaky(10)));

        let id = bus
            .send(
                AgentId::new("dispatcher"),
                Recipient::Agent(AgentId::new("a1")),
                0,
                control("x"),
            )
            .await;
        let message = bus.next_pending().await.unwrap();

        assert_eq!(bus.deliver(message).await, DeliveryState::Failed);
        let stored = bus.message(id).await.unwrap();
        assert!(!stored.delivered());
        assert_eq!(stored.attempts(), 3);
        assert_eq!(bus.counts().await.failed, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let bus = bus();
        bus.subscribe(AgentId::new("a1"), Arc::new(Inbox::broken()));
        let id = bus
            .send(
                AgentId::new("dispatcher"),
                Recipient::Agent(AgentId::new("a1")),
                0,
                control("x"),
            )
            .await;

        let message = bus.next_pending().await.unwrap();
        assert_eq!(bus.deliver(message).await, DeliveryState::Failed);
        assert_eq!(bus.message(id).await.unwrap().attempts(), 1);
    }

    #[tokio::test]
    async fn missing_subscriber_fails_delivery() {
        let bus = bus();
        let id = bus
            .send(
                AgentId::new("dispatcher"),
                Recipient::Agent(AgentId::new("nobody")),
                0,
                control("x"),
            )
            .await;
        let message = bus.next_pending().await.unwrap();

        assert_eq!(bus.deliver(message).await, DeliveryState::Failed);
        let stored = bus.message(id).await.unwrap();
        assert!(stored.last_error().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let bus = bus();
        let a1 = Arc::new(Inbox::default());
        let a2 = Arc::new(Inbox::default());
        bus.subscribe(AgentId::new("a1"), a1.clone());
        bus.subscribe(AgentId::new("a2"), a2.clone());

        bus.send(
            AgentId::new("a1"),
            Recipient::Broadcast,
            5,
            MessagePayload::Collaborate {
                topic: "contract review".into(),
                participants: vec![AgentId::new("a1"), AgentId::new("a2")],
                task: None,
            },
        )
        .await;
        let message = bus.next_pending().await.unwrap();

        assert_eq!(bus.deliver(message).await, DeliveryState::Delivered);
        assert!(a1.received().is_empty());
        assert_eq!(a2.received().len(), 1);

        let counts = bus.counts().await;
        assert_eq!(counts.delivered, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn processed_messages_leave_through_a_bounded_archive() {
        let bus = bus_with_archive(2);
        bus.subscribe(AgentId::new("a1"), Arc::new(Inbox::default()));

        let mut ids = Vec::new();
        for i in 0..5 {
            let id = bus
                .send(
                    AgentId::new("dispatcher"),
                    Recipient::Agent(AgentId::new("a1")),
                    0,
                    control(&format!("m{i}")),
                )
                .await;
            let message = bus.next_pending().await.unwrap();
            assert_eq!(bus.deliver(message).await, DeliveryState::Delivered);
            ids.push(id);
        }

        assert!(bus.message(ids[0]).await.is_none());
        assert!(bus.message(ids[2]).await.is_none());
        assert!(bus.message(ids[3]).await.unwrap().delivered());
        assert!(bus.message(ids[4]).await.unwrap().delivered());
        assert_eq!(
            bus.counts().await,
            MessageCounts {
                pending: 0,
                delivered: 5,
                failed: 0,
            }
        );
    }
}
