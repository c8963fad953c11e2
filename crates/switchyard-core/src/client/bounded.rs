//! BoundedClient - キャッシュ + 同時実行数制限 + リトライ
//!
//! 1. cache lookup by fingerprint (a hit uses no slot and no external call)
//! 2. one of `concurrency` global slots is acquired per invoke attempt
//! 3. transient failures are retried with exponential backoff; the slot is
//!    given back while sleeping
//! 4. successful results are cached
//!
//! The client never touches task or agent state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CacheStats, Fingerprint, RateLimiter, ResultCache};
use crate::config::ClientConfig;
use crate::domain::{AgentId, ExecutionError};
use crate::ports::{Clock, Executor, RequestDescriptor};
use crate::retry::RetryPolicy;

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    latency_ms_total: AtomicU64,
}

/// Invoke statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    /// External invokes issued (cache hits excluded).
    pub invocations: u64,
    pub retries: u64,
    /// Invokes that returned an error.
    pub failures: u64,
    pub average_latency_ms: f64,
    pub available_slots: usize,
    pub cache: CacheStats,
}

pub struct BoundedClient {
    executor: Arc<dyn Executor>,
    cache: ResultCache,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
    invoke_timeout: Duration,
    rate_limiter: Option<RateLimiter>,
    counters: Counters,
}

impl BoundedClient {
    pub fn new(config: &ClientConfig, executor: Arc<dyn Executor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            cache: ResultCache::new(&config.cache, clock),
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry.policy(),
            invoke_timeout: config.invoke_timeout(),
            rate_limiter: config.rate_limit.as_ref().map(RateLimiter::new),
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute `request` on `agent`.
    ///
    /// `cancel` is observed before each attempt, while waiting for a slot or a
    /// rate-limit token, during backoff and (best-effort) during the invoke.
    pub async fn execute(
        &self,
        agent: &AgentId,
        request: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let key = Fingerprint::of(agent, request);
        if let Some(hit) = self.cache.get(&key) {
            debug!(agent = %agent, fingerprint = %key, "cache hit");
            return Ok(hit);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let outcome = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                    permit = Arc::clone(&self.slots).acquire_owned() => permit
                        .map_err(|_| ExecutionError::permanent("client slots closed"))?,
                };

                // finished by a concurrent caller while we waited for the slot
                if let Some(hit) = self.cache.peek(&key) {
                    return Ok(hit);
                }

                if let Some(limiter) = &self.rate_limiter {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                        _ = limiter.acquire() => {}
                    }
                }

                let outcome = self.invoke_once(agent, request, cancel).await;
                if let Ok(value) = &outcome {
                    self.cache.insert(key.clone(), value.clone());
                }
                outcome
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(ExecutionError::Transient(message)) => message,
                Err(other) => return Err(other),
            };

            if !self.retry.allows_retry(attempt) {
                warn!(agent = %agent, attempts = attempt, error = %error, "retries exhausted");
                return Err(ExecutionError::ExhaustedRetries {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.retry.next_delay(attempt);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                agent = %agent,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn invoke_once(
        &self,
        agent: &AgentId,
        request: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExecutionError> {
        let started = Instant::now();
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = tokio::time::timeout(
                self.invoke_timeout,
                self.executor.invoke(agent, request, self.invoke_timeout),
            ) => result.unwrap_or_else(|_| {
                Err(ExecutionError::transient(format!(
                    "invoke timed out after {}ms",
                    self.invoke_timeout.as_millis()
                )))
            }),
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.counters
            .latency_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn stats(&self) -> ClientStats {
        let invocations = self.counters.invocations.load(Ordering::Relaxed);
        let latency_total = self.counters.latency_ms_total.load(Ordering::Relaxed);
        ClientStats {
            invocations,
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            average_latency_ms: if invocations == 0 {
                0.0
            } else {
                latency_total as f64 / invocations as f64
            },
            available_slots: self.available_slots(),
            cache: self.cache.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::{CacheConfig, RateLimitConfig, RetryConfig};
    use crate::domain::{Category, TaskPayload};
    use crate::ports::SystemClock;

    /// Plays back scripted results, then repeats the fallback.
    struct Scripted {
        script: Mutex<VecDeque<Result<serde_json::Value, ExecutionError>>>,
        fallback: Result<serde_json::Value, ExecutionError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn always(result: Result<serde_json::Value, ExecutionError>) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: result,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn then(self, result: Result<serde_json::Value, ExecutionError>) -> Self {
            self.script.lock().push_back(result);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn invoke(
            &self,
            _agent: &AgentId,
            _request: &RequestDescriptor,
            _timeout: Duration,
        ) -> Result<serde_json::Value, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn config(concurrency: usize) -> ClientConfig {
        ClientConfig {
            concurrency,
            invoke_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: None,
        }
    }

    fn client(executor: Arc<Scripted>, concurrency: usize) -> BoundedClient {
        BoundedClient::new(&config(concurrency), executor, Arc::new(SystemClock))
    }

    fn request(text: &str) -> RequestDescriptor {
        RequestDescriptor::new(Category::new("ocr"), TaskPayload::prompt(text))
    }

    #[tokio::test(start_paused = true)]
    async fn identical_requests_invoke_once() {
        let executor = Arc::new(Scripted::always(Ok(json!("answer"))));
        let client = client(executor.clone(), 5);
        let agent = AgentId::new("a1");
        let cancel = CancellationToken::new();

        let first = client.execute(&agent, &request("q"), &cancel).await.unwrap();
        let second = client.execute(&agent, &request("q"), &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(executor.calls(), 1);
        assert_eq!(client.stats().cache.hits, 1);

        client.execute(&agent, &request("other"), &cancel).await.unwrap();
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_invokes_max_retries_plus_one_times() {
        let executor = Arc::new(Scripted::always(Err(ExecutionError::transient("503"))));
        let client = client(executor.clone(), 5);

        let started = Instant::now();
        let err = client
            .execute(&AgentId::new("a1"), &request("q"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExecutionError::ExhaustedRetries {
                attempts: 4,
                last: "503".into()
            }
        );
        assert_eq!(executor.calls(), 4);
        // 1s + 2s + 4s of backoff
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(client.stats().retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let executor = Arc::new(Scripted::always(Err(ExecutionError::permanent("401"))));
        let client = client(executor.clone(), 5);

        let err = client
            .execute(&AgentId::new("a1"), &request("q"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::permanent("401"));
        assert_eq!(executor.calls(), 1);
        assert!(client.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let executor = Arc::new(
            Scripted::always(Ok(json!("late")))
                .then(Err(ExecutionError::transient("timeout")))
                .then(Err(ExecutionError::transient("timeout"))),
        );
        let client = client(executor.clone(), 5);

        let value = client
            .execute(&AgentId::new("a1"), &request("q"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(value, json!("late"));
        assert_eq!(executor.calls(), 3);
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_invoke_times_out_as_transient() {
        let executor = Arc::new(
            Scripted::always(Ok(json!("slow"))).with_delay(Duration::from_secs(10)),
        );
        let mut config = config(1);
        config.invoke_timeout_ms = 100;
        config.retry.max_retries = 0;
        let client = BoundedClient::new(&config, executor.clone(), Arc::new(SystemClock));

        let err = client
            .execute(&AgentId::new("a1"), &request("q"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::ExhaustedRetries { attempts: 1, .. }));
        assert_eq!(client.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_backoff() {
        let executor = Arc::new(Scripted::always(Err(ExecutionError::transient("503"))));
        let client = Arc::new(client(executor.clone(), 5));
        let cancel = CancellationToken::new();

        let handle = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .execute(&AgentId::new("a1"), &request("q"), &cancel)
                    .await
            })
        };

        // first attempt failed, now sleeping 1s before the second
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), Err(ExecutionError::Cancelled));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_free_during_backoff() {
        let flaky = Arc::new(
            Scripted::always(Ok(json!("ok"))).then(Err(ExecutionError::transient("503"))),
        );
        let client = Arc::new(client(flaky.clone(), 1));

        let retrying = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .execute(&AgentId::new("a1"), &request("first"), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the first call is backing off; a second call gets the only slot
        assert_eq!(client.available_slots(), 1);
        let second = client
            .execute(&AgentId::new("a1"), &request("second"), &CancellationToken::new())
            .await;
        assert_eq!(second, Ok(json!("ok")));

        assert_eq!(retrying.await.unwrap(), Ok(json!("ok")));
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_everything() {
        let executor = Arc::new(Scripted::always(Ok(json!("x"))));
        let client = client(executor.clone(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            client.execute(&AgentId::new("a1"), &request("q"), &cancel).await,
            Err(ExecutionError::Cancelled)
        );
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_spaces_invokes_and_honours_cancel() {
        let executor = Arc::new(Scripted::always(Ok(json!("ok"))));
        let config = ClientConfig {
            rate_limit: Some(RateLimitConfig {
                burst: 1,
                per_second: 1.0,
            }),
            ..config(4)
        };
        let client = Arc::new(BoundedClient::new(
            &config,
            executor.clone(),
            Arc::new(SystemClock),
        ));
        let agent = AgentId::new("a1");
        let cancel = CancellationToken::new();

        let started = Instant::now();
        client.execute(&agent, &request("one"), &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));

        client.execute(&agent, &request("two"), &cancel).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1), "{waited:?}");
        assert!(waited < Duration::from_millis(1_100), "{waited:?}");

        // bucket is empty again; cancel while waiting for the next token
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let result = client.execute(&agent, &request("three"), &token).await;

        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert_eq!(executor.calls(), 2);
        assert_eq!(client.available_slots(), 4);
    }
}
