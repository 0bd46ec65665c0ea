//! Anti-replay gate.
//!
//! A `request_id` may cause at most one pipeline run; identical retries get
//! the cached decision back, tampered retries are denied. The record for a
//! request either does not exist, holds the canonical fingerprint with a
//! pending marker, or holds the fingerprint plus the cached terminal
//! decision. Records are shared by every gateway instance and expire after
//! the configured TTL.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use casf_core::canonical::canonical_json;
use casf_core::types::{VerifyRequest, VerifyResponse};

use crate::kv::{RedisHandle, KV_TIMEOUT};

/// Compare-and-set decision write: refuses to clobber a record whose
/// fingerprint differs (a pending key from a crashed worker, or another
/// payload that won the claim race).
const CAS_STORE_SCRIPT: &str = r"
local cur = redis.call('GET', KEYS[1])
if cur then
  local ok, rec = pcall(cjson.decode, cur)
  if not ok or rec.fingerprint ~= ARGV[1] then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
";

/// Errors from the anti-replay store.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The store rejected or dropped the command.
    #[error("replay store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The command exceeded [`KV_TIMEOUT`].
    #[error("replay store timed out")]
    Timeout,
}

/// What the claim protocol observed for a `request_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// First sighting; the pending claim was written.
    Fresh,
    /// Identical payload already decided; here is the cached decision.
    Hit(VerifyResponse),
    /// Same `request_id`, different payload.
    Mismatch,
    /// Same `request_id` is mid-flight in another pipeline.
    Concurrent,
    /// The store could not be consulted.
    Unavailable,
}

/// SHA-256 fingerprint over the canonicalized request body with the
/// `request_id` field removed.
#[must_use]
pub fn fingerprint(request: &VerifyRequest) -> String {
    let mut body = request.to_value();
    if let Value::Object(map) = &mut body {
        map.remove("request_id");
    }
    let digest = Sha256::digest(canonical_json(&body).as_bytes());
    hex::encode(digest)
}

/// Seam for the anti-replay store.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Runs the claim protocol for a request.
    async fn claim(&self, request_id: Uuid, fingerprint: &str) -> ReplayOutcome;

    /// Caches the terminal decision. Returns `false` when the stored
    /// fingerprint differs and the write was refused.
    async fn store_decision(
        &self,
        request_id: Uuid,
        fingerprint: &str,
        response: &VerifyResponse,
    ) -> Result<bool, ReplayError>;

    /// Readiness probe for the backing store.
    async fn ping(&self) -> Result<(), ReplayError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplayRecord {
    fingerprint: String,
    status: ReplayStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decision: Option<VerifyResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum ReplayStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "done")]
    Done,
}

impl ReplayRecord {
    fn pending(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            status: ReplayStatus::Pending,
            decision: None,
        }
    }

    fn done(fingerprint: &str, response: &VerifyResponse) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            status: ReplayStatus::Done,
            decision: Some(response.clone()),
        }
    }

    fn to_wire(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

fn replay_key(request_id: Uuid) -> String {
    format!("casf:req:{request_id}")
}

fn fingerprints_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Redis-backed anti-replay store.
pub struct RedisReplayStore {
    handle: Arc<RedisHandle>,
    ttl_secs: u64,
    cas_store: redis::Script,
}

impl RedisReplayStore {
    /// Creates the store over a shared Redis handle.
    #[must_use]
    pub fn new(handle: Arc<RedisHandle>, ttl_secs: u64) -> Self {
        Self {
            handle,
            ttl_secs,
            cas_store: redis::Script::new(CAS_STORE_SCRIPT),
        }
    }

    async fn try_claim(
        &self,
        request_id: Uuid,
        fp: &str,
    ) -> Result<ReplayOutcome, redis::RedisError> {
        let mut conn = self.handle.conn().await?;
        let key = replay_key(request_id);
        let pending = ReplayRecord::pending(fp).to_wire();

        // Two attempts cover the record expiring between the failed SET NX
        // and the GET.
        for _ in 0..2 {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&pending)
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_secs)
                .query_async(&mut conn)
                .await?;
            if claimed.is_some() {
                return Ok(ReplayOutcome::Fresh);
            }

            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else {
                continue;
            };

            let Ok(record) = serde_json::from_str::<ReplayRecord>(&raw) else {
                // A record we cannot read is a record we cannot prove
                // idempotent; deny as a payload mismatch.
                warn!(%request_id, "unparseable anti-replay record");
                return Ok(ReplayOutcome::Mismatch);
            };

            if !fingerprints_match(&record.fingerprint, fp) {
                return Ok(ReplayOutcome::Mismatch);
            }
            return Ok(match (record.status, record.decision) {
                (ReplayStatus::Done, Some(decision)) => ReplayOutcome::Hit(decision),
                _ => ReplayOutcome::Concurrent,
            });
        }

        Ok(ReplayOutcome::Concurrent)
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    async fn claim(&self, request_id: Uuid, fingerprint: &str) -> ReplayOutcome {
        match tokio::time::timeout(KV_TIMEOUT, self.try_claim(request_id, fingerprint)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(%request_id, error = %err, "anti-replay claim failed");
                ReplayOutcome::Unavailable
            },
            Err(_) => {
                warn!(%request_id, "anti-replay claim timed out");
                ReplayOutcome::Unavailable
            },
        }
    }

    async fn store_decision(
        &self,
        request_id: Uuid,
        fingerprint: &str,
        response: &VerifyResponse,
    ) -> Result<bool, ReplayError> {
        let done = ReplayRecord::done(fingerprint, response).to_wire();
        let fut = async {
            let mut conn = self.handle.conn().await?;
            self.cas_store
                .key(replay_key(request_id))
                .arg(fingerprint)
                .arg(done)
                .arg(self.ttl_secs)
                .invoke_async::<i64>(&mut conn)
                .await
        };
        match tokio::time::timeout(KV_TIMEOUT, fut).await {
            Ok(Ok(wrote)) => Ok(wrote == 1),
            Ok(Err(err)) => Err(ReplayError::Store(err)),
            Err(_) => Err(ReplayError::Timeout),
        }
    }

    async fn ping(&self) -> Result<(), ReplayError> {
        self.handle.ping().await.map_err(ReplayError::Store)
    }
}
