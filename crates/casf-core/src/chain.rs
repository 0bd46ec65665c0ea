//! Audit hash-chain engine.
//!
//! Every audit event carries a lowercase-hex SHA-256 over its own content
//! plus the hash of its predecessor, so any mutation of a persisted event
//! breaks every link after it. The genesis event links to the empty string.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canonical::canonical_json;
use crate::types::AuditEvent;

/// Field separator inside the hash preimage.
const SEP: &str = "|";

/// Outcome of a full-chain verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerification {
    /// Every link recomputed and matched.
    Valid,
    /// The first event whose linkage or content hash failed.
    BrokenAt(usize),
}

impl ChainVerification {
    /// True when the chain verified end to end.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Computes an event hash from its content and predecessor hash.
///
/// The preimage is the `|`-joined concatenation of `request_id`,
/// `event_id`, `ts`, `actor`, `action`, `decision`, the canonical payload,
/// and `prev_hash`, in that order. `prev_hash` is the empty string for the
/// genesis event.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn compute_hash(
    prev_hash: &str,
    request_id: &Uuid,
    event_id: &Uuid,
    ts: &str,
    actor: &str,
    action: &str,
    decision: &str,
    payload: &Value,
) -> String {
    let request_id = request_id.to_string();
    let event_id = event_id.to_string();
    let payload = canonical_json(payload);
    let preimage = [
        request_id.as_str(),
        event_id.as_str(),
        ts,
        actor,
        action,
        decision,
        payload.as_str(),
        prev_hash,
    ]
    .join(SEP);

    let digest = Sha256::digest(preimage.as_bytes());
    hex::encode(digest)
}

/// Recomputes the content hash of a persisted event from its own fields.
#[must_use]
pub fn hash_event(event: &AuditEvent) -> String {
    compute_hash(
        &event.prev_hash,
        &event.request_id,
        &event.event_id,
        &event.ts,
        &event.actor,
        &event.action,
        event.decision.as_str(),
        &event.payload,
    )
}

/// Walks an insertion-ordered event sequence and verifies every link.
///
/// Checks both linkage (`prev_hash` equals the predecessor's `hash`, empty
/// for the first event) and content (each `hash` recomputes from its
/// fields). Returns the index of the first failure.
#[must_use]
pub fn verify_chain(events: &[AuditEvent]) -> ChainVerification {
    for (i, event) in events.iter().enumerate() {
        let expected_prev = if i == 0 {
            ""
        } else {
            events[i - 1].hash.as_str()
        };
        if event.prev_hash != expected_prev {
            return ChainVerification::BrokenAt(i);
        }
        if hash_event(event) != event.hash {
            return ChainVerification::BrokenAt(i);
        }
    }
    ChainVerification::Valid
}
