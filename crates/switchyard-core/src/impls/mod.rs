//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **BroadcastEventSink** / **MemoryEventSink** / **NoopEventSink**
//! - **MemoryResultSink** / **NoopResultSink**

pub mod event_sinks;
pub mod result_sinks;

pub use self::event_sinks::{BroadcastEventSink, MemoryEventSink, NoopEventSink};
pub use self::result_sinks::{MemoryResultSink, NoopResultSink};
