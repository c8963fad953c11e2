//! Ports - 抽象化レイヤー
//!
//! Traits at the seams of the dispatcher: time, ids, the remote executor, the
//! result store, lifecycle event consumers and bus recipients.

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod id_generator;
pub mod message_handler;
pub mod result_sink;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::executor::{Executor, RequestDescriptor};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_handler::MessageHandler;
pub use self::result_sink::{ResultSink, SinkError};
