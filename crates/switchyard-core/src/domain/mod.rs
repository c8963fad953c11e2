//! Domain model (ids, tasks, agents, messages, errors, events).

pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod task;

pub use self::agent::{Agent, AgentLoad, AgentSpec, Health};
pub use self::errors::{DispatchError, ErrorKind, ExecutionError};
pub use self::events::LifecycleEvent;
pub use self::ids::{AgentId, Category, MessageId, TaskId};
pub use self::message::{DeliveryState, Message, MessagePayload, Recipient};
pub use self::task::{Priority, Task, TaskPayload, TaskState};
