//! EventSink port - イベント記録の抽象化
//!
//! Emission must not block: implementations buffer or drop.

use crate::domain::LifecycleEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}
