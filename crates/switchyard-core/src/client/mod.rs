//! Client module: the bounded path to the external executor.
//!
//! - **ResultCache**: TTL + insertion-order eviction
//! - **Fingerprint**: cache key
//! - **RateLimiter**: optional token bucket
//! - **BoundedClient**: cache, global slots, retry with backoff

mod bounded;
mod cache;
mod fingerprint;
mod rate_limit;

pub use bounded::{BoundedClient, ClientStats};
pub use cache::{CacheStats, ResultCache};
pub use fingerprint::Fingerprint;
pub use rate_limit::RateLimiter;
