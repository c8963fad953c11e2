//! EventSink implementations.
//!
//! - **BroadcastEventSink**: fans events out to any number of subscribers
//! - **MemoryEventSink**: records events in order (tests, post-mortems)
//! - **NoopEventSink**: drops everything

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::LifecycleEvent;
use crate::ports::EventSink;

/// BroadcastEventSink は tokio broadcast channel でイベントを配る
///
/// Slow subscribers lag (and see `RecvError::Lagged`) instead of blocking the
/// emitter. With no subscriber the event is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: LifecycleEvent) {
        // 購読者がいなければ捨てる
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: LifecycleEvent) {}
}
