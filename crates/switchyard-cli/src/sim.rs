//! Simulated agents for the demo: random latency, random failures.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::info;

use switchyard_core::domain::{AgentId, ExecutionError, Message};
use switchyard_core::ports::{Executor, MessageHandler, RequestDescriptor};

pub struct SimulatedExecutor {
    pub latency: Duration,
    pub transient_rate: f64,
    pub permanent_rate: f64,
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn invoke(
        &self,
        agent: &AgentId,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<serde_json::Value, ExecutionError> {
        // thread_rng is not Send; draw everything before the first await
        let (latency, roll) = {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.5..1.5);
            (self.latency.mul_f64(jitter), rng.gen_range(0.0..1.0))
        };

        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ExecutionError::transient("simulated timeout"));
        }
        tokio::time::sleep(latency).await;

        if roll < self.permanent_rate {
            return Err(ExecutionError::permanent("simulated bad request"));
        }
        if roll < self.permanent_rate + self.transient_rate {
            return Err(ExecutionError::transient("simulated upstream overload"));
        }
        Ok(json!({
            "agent": agent,
            "category": request.category,
            "kind": request.payload.kind(),
            "latency_ms": latency.as_millis() as u64,
        }))
    }
}

/// Logs every bus message it receives.
pub struct LoggingInbox;

#[async_trait]
impl MessageHandler for LoggingInbox {
    async fn deliver(&self, recipient: &AgentId, message: &Message) -> Result<(), ExecutionError> {
        info!(
            recipient = %recipient,
            from = %message.from,
            message_id = %message.id,
            priority = message.priority,
            "message received"
        );
        Ok(())
    }
}
