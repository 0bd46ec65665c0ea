//! Atomic per-subject rate limiting over the shared key-value store.
//!
//! The counter increment and its TTL arming run as one server-evaluated
//! script so concurrent gateways cannot both observe the pre-increment
//! value. No ordering is promised across keys, only atomicity per call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::kv::{RedisHandle, KV_TIMEOUT};

/// Atomic INCR with TTL armed on the first increment of a window.
const INCR_EXPIRE_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
";

/// Errors from the rate-limit store; the orchestrator treats any of them
/// as `unavailable` and fails closed on write tools.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The store rejected or dropped the command.
    #[error("rate limit store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The command exceeded [`KV_TIMEOUT`].
    #[error("rate limit store timed out")]
    Timeout,
}

/// Result of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Within the limit; the counter now reads `count`.
    Allowed(u64),
    /// Over the limit; the counter now reads `count`.
    Exceeded(u64),
}

/// Seam for the rate-limit counter store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically consumes one unit for `key` within `window`, allowing at
    /// most `limit` units.
    async fn check_and_consume(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<RateLimitOutcome, RateLimitError>;
}

/// Redis-backed rate limiter.
pub struct RedisRateLimiter {
    handle: Arc<RedisHandle>,
    incr_expire: redis::Script,
}

impl RedisRateLimiter {
    /// Creates the limiter over a shared Redis handle.
    #[must_use]
    pub fn new(handle: Arc<RedisHandle>) -> Self {
        Self {
            handle,
            incr_expire: redis::Script::new(INCR_EXPIRE_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimiter {
    async fn check_and_consume(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<RateLimitOutcome, RateLimitError> {
        let fut = async {
            let mut conn = self.handle.conn().await?;
            self.incr_expire
                .key(key)
                .arg(window.as_secs())
                .invoke_async::<i64>(&mut conn)
                .await
        };
        let count = match tokio::time::timeout(KV_TIMEOUT, fut).await {
            Ok(Ok(count)) => u64::try_from(count).unwrap_or(u64::MAX),
            Ok(Err(err)) => return Err(RateLimitError::Store(err)),
            Err(_) => return Err(RateLimitError::Timeout),
        };

        if count <= limit {
            Ok(RateLimitOutcome::Allowed(count))
        } else {
            Ok(RateLimitOutcome::Exceeded(count))
        }
    }
}

/// Counter key for the SMS-per-patient burst limit.
#[must_use]
pub fn sms_key(patient_id: &str) -> String {
    format!("sms:{patient_id}")
}
