//! Config - TOML 設定
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! [queue]
//! max_retries = 3
//!
//! [client]
//! concurrency = 5
//!
//! [client.retry]
//! base_delay_ms = 1000
//!
//! [client.rate_limit]
//! burst = 10
//! per_second = 5.0
//!
//! [balancer]
//! window = 10
//! failure_threshold = 0.5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchyardConfig {
    pub queue: QueueConfig,
    pub client: ClientConfig,
    pub balancer: BalancerConfig,
    pub dispatcher: DispatcherConfig,
    pub bus: BusConfig,
}

impl SwitchyardConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SwitchyardConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.concurrency == 0 {
            return Err(invalid("client.concurrency must be at least 1"));
        }
        if self.client.cache.capacity == 0 {
            return Err(invalid("client.cache.capacity must be at least 1"));
        }
        if let Some(limit) = &self.client.rate_limit {
            if limit.burst == 0 {
                return Err(invalid("client.rate_limit.burst must be at least 1"));
            }
            if !(limit.per_second > 0.0 && limit.per_second.is_finite()) {
                return Err(invalid("client.rate_limit.per_second must be positive"));
            }
        }
        self.client.retry.validate("client.retry")?;
        self.bus.retry.validate("bus.retry")?;

        let b = &self.balancer;
        if b.window == 0 {
            return Err(invalid("balancer.window must be at least 1"));
        }
        if b.min_samples > b.window {
            return Err(invalid("balancer.min_samples cannot exceed balancer.window"));
        }
        if !(b.failure_threshold > 0.0 && b.failure_threshold <= 1.0) {
            return Err(invalid("balancer.failure_threshold must be in (0, 1]"));
        }
        if !(b.latency_alpha > 0.0 && b.latency_alpha <= 1.0) {
            return Err(invalid("balancer.latency_alpha must be in (0, 1]"));
        }
        if self.dispatcher.event_buffer == 0 {
            return Err(invalid("dispatcher.event_buffer must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Requeues allowed per task before it fails terminally.
    pub max_retries: u32,

    /// Terminal tasks kept for lookup.
    pub archive_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            archive_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Global ceiling on outstanding external invokes.
    pub concurrency: usize,
    pub invoke_timeout_ms: u64,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

impl ClientConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            invoke_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "{section}.multiplier must be at least 1.0"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "{section}.max_delay_ms must not be below base_delay_ms"
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            capacity: 1000,
        }
    }
}

/// Token bucket in front of the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerConfig {
    /// Number of recent releases the failure rate is computed over.
    pub window: usize,
    pub failure_threshold: f64,

    /// Releases required in the window before health is judged.
    pub min_samples: usize,
    pub cooldown_secs: u64,

    /// Weight of the newest sample in the latency moving average.
    pub latency_alpha: f64,
    pub heartbeat_timeout_secs: Option<u64>,
}

impl BalancerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            failure_threshold: 0.5,
            min_samples: 5,
            cooldown_secs: 60,
            latency_alpha: 0.2,
            heartbeat_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// How long to wait before retrying a task no agent could take.
    pub no_agent_backoff_ms: u64,

    /// Capacity of the lifecycle event channel.
    pub event_buffer: usize,
}

impl DispatcherConfig {
    pub fn no_agent_backoff(&self) -> Duration {
        Duration::from_millis(self.no_agent_backoff_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            no_agent_backoff_ms: 250,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub retry: RetryConfig,

    /// Processed messages kept for lookup.
    pub archive_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            archive_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SwitchyardConfig::from_toml_str("").unwrap();
        assert_eq!(config, SwitchyardConfig::default());
        assert_eq!(config.client.concurrency, 5);
        assert_eq!(config.client.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.client.retry.policy().next_delay(3), Duration::from_secs(4));
        assert!(config.client.rate_limit.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = SwitchyardConfig::from_toml_str(
            r#"
            [queue]
            max_retries = 1

            [client]
            concurrency = 2

            [client.cache]
            capacity = 10

            [client.rate_limit]
            burst = 4
            per_second = 2.5

            [balancer]
            window = 20
            heartbeat_timeout_secs = 30

            [bus]
            archive_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_retries, 1);
        assert_eq!(config.queue.archive_capacity, 1024);
        assert_eq!(config.client.concurrency, 2);
        assert_eq!(config.client.cache.capacity, 10);
        assert_eq!(config.client.cache.ttl_secs, 86_400);
        assert_eq!(
            config.client.rate_limit,
            Some(RateLimitConfig {
                burst: 4,
                per_second: 2.5
            })
        );
        assert_eq!(config.balancer.window, 20);
        assert_eq!(config.bus.archive_capacity, 16);
        assert_eq!(config.bus.retry, RetryConfig::default());
        assert_eq!(
            config.balancer.heartbeat_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[rstest]
    #[case("[client]\nconcurrency = 0")]
    #[case("[client.cache]\ncapacity = 0")]
    #[case("[balancer]\nwindow = 0")]
    #[case("[balancer]\nfailure_threshold = 1.5")]
    #[case("[balancer]\nlatency_alpha = 0.0")]
    #[case("[balancer]\nwindow = 3\nmin_samples = 5")]
    #[case("[client.retry]\nmultiplier = 0.5")]
    #[case("[bus.retry]\nbase_delay_ms = 5000\nmax_delay_ms = 10")]
    #[case("[client.rate_limit]\nburst = 0\nper_second = 1.0")]
    fn rejects_invalid_values(#[case] doc: &str) {
        assert!(matches!(
            SwitchyardConfig::from_toml_str(doc),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        assert!(matches!(
            SwitchyardConfig::from_toml_str("[queue]\nmax_retry = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
