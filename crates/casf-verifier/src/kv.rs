//! Shared Redis connection handle.
//!
//! The anti-replay gate and the rate limiter share one multiplexed
//! connection manager. Connection establishment is lazy so the gateway
//! starts (and fails closed per request) even when Redis is down at boot;
//! once established, the manager reconnects on its own.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

/// Budget for every rate-limit / anti-replay command.
pub const KV_TIMEOUT: Duration = Duration::from_millis(200);

/// Budget for readiness probes.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lazily-connected Redis handle.
pub struct RedisHandle {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisHandle {
    /// Creates a handle for the store at `url`. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse.
    pub fn new(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
        })
    }

    /// A cloned connection manager, establishing the connection on first
    /// use. A failed first attempt is retried on the next call.
    ///
    /// # Errors
    ///
    /// Returns the connection error; callers map it to their
    /// `unavailable` classification.
    pub async fn conn(&self) -> Result<ConnectionManager, redis::RedisError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    /// Readiness probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the store does not answer `PING` within the
    /// health budget.
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let fut = async {
            let mut conn = self.conn().await?;
            redis::cmd("PING").query_async::<()>(&mut conn).await
        };
        match tokio::time::timeout(HEALTH_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "healthcheck ping timed out",
            ))),
        }
    }
}
