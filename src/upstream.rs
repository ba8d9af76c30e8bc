//! Bounded, retrying, cancellable pool for embedder and generator calls.
//!
//! Every call to an external capability goes through [`UpstreamPool::call`],
//! which:
//!
//! - holds one of `max_concurrency` semaphore permits for the duration of
//!   each attempt (permits are released while backing off);
//! - bounds each attempt with a deadline;
//! - retries transient failures ([`UpstreamError::is_retryable`]) with
//!   exponential backoff: `base, 2·base, 4·base, …` capped at `max_backoff`,
//!   up to `max_attempts` attempts in total;
//! - returns [`PoolError::Cancelled`] as soon as the cancellation token
//!   fires, whether waiting for a permit, mid-attempt, or backing off.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use support_harness_core::error::UpstreamError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamConfig;
use crate::error::PoolError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based; attempt 1 has none).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&UpstreamConfig> for RetryPolicy {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

/// Shared by the synchronizer and the composer so that both respect one
/// concurrency bound.
#[derive(Clone)]
pub struct UpstreamPool {
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl UpstreamPool {
    pub fn new(max_concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.max_concurrency, RetryPolicy::from(config))
    }

    /// Run `op` with retries. `service` names the capability in errors and
    /// logs.
    pub async fn call<T, F, Fut>(
        &self,
        service: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, PoolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let delay = self.policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    permit = self.permits.acquire() => match permit {
                        Ok(p) => p,
                        Err(_) => {
                            return Err(PoolError::Upstream(UpstreamError::Unavailable {
                                service: service.to_string(),
                                message: "worker pool closed".to_string(),
                            }))
                        }
                    },
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    outcome = tokio::time::timeout(self.policy.attempt_timeout, op()) => {
                        outcome.unwrap_or_else(|_| Err(UpstreamError::Timeout {
                            service: service.to_string(),
                        }))
                    }
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        service,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "upstream call failed, retrying"
                    );
                }
                Err(e) => return Err(PoolError::Upstream(e)),
            }
        }
    }
}
