// Resilience primitives shared by every network-facing component
pub mod cache;
pub mod circuit_breaker;
pub mod retry;

pub use cache::TtlCache;
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use retry::{retry_async, RetryPolicy, RetryQueue, RetryQueueReport, TaskFuture};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Breakers plus retry policy for one family of external dependencies
///
/// Cheap to clone; clones share breaker state.
#[derive(Clone)]
pub struct Resilience {
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
}

impl Resilience {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, retry: RetryPolicy) -> Self {
        Self { breakers, retry }
    }

    pub fn with_defaults(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self::new(
            Arc::new(CircuitBreakerRegistry::new(failure_threshold, reset_timeout)),
            RetryPolicy::default(),
        )
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.breakers.is_open(key)
    }

    /// Run `op` guarded by the breaker for `key` and the retry policy
    ///
    /// An open breaker fails fast without invoking `op`. The whole attempt
    /// chain counts as one success or one failure for the breaker.
    pub async fn call<F, Fut, T>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breakers.check(key)?;

        match retry_async(key, &self.retry, op).await {
            Ok(value) => {
                self.breakers.record_success(key);
                Ok(value)
            }
            Err(e) => {
                self.breakers.record_failure(key);
                Err(e)
            }
        }
    }
}
