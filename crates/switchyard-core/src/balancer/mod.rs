//! Balancer module: agent registry, least-loaded-ratio selection and health.

mod health;
mod registry;

pub use health::HealthTracker;
pub use registry::AgentRegistry;
