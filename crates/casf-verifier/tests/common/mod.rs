//! In-memory fakes for the four pipeline collaborators.
//!
//! Each fake honors the same contract as its production counterpart and
//! adds toggles for the failure modes the pipeline must survive: an
//! `offline` switch and, for audit, a fail-the-next-N-appends counter to
//! exercise the retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use casf_core::chain::compute_hash;
use casf_core::types::{AuditDraft, AuditEvent, VerifyRequest, VerifyResponse};

use casf_verifier::audit::{AuditError, AuditStore};
use casf_verifier::metrics::{new_shared_registry, SharedMetricsRegistry};
use casf_verifier::opa::{PolicyDecision, PolicyEngine, PolicyError, PolicyInput};
use casf_verifier::ratelimit::{RateLimitError, RateLimitOutcome, RateLimitStore};
use casf_verifier::replay::{ReplayError, ReplayOutcome, ReplayStore};
use casf_verifier::{Verifier, VerifierConfig};

// ============================================================================
// Replay
// ============================================================================

#[derive(Clone)]
struct StoredReplay {
    fingerprint: String,
    decision: Option<VerifyResponse>,
}

#[derive(Default)]
pub struct FakeReplayStore {
    records: Mutex<HashMap<Uuid, StoredReplay>>,
    offline: AtomicBool,
}

impl FakeReplayStore {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seeds a pending claim, as if another pipeline won the race.
    pub fn seed_pending(&self, request_id: Uuid, fingerprint: &str) {
        self.records.lock().unwrap().insert(
            request_id,
            StoredReplay {
                fingerprint: fingerprint.to_string(),
                decision: None,
            },
        );
    }

    pub fn cached_decision(&self, request_id: Uuid) -> Option<VerifyResponse> {
        self.records
            .lock()
            .unwrap()
            .get(&request_id)
            .and_then(|r| r.decision.clone())
    }
}

#[async_trait]
impl ReplayStore for FakeReplayStore {
    async fn claim(&self, request_id: Uuid, fingerprint: &str) -> ReplayOutcome {
        if self.offline.load(Ordering::SeqCst) {
            return ReplayOutcome::Unavailable;
        }
        let mut records = self.records.lock().unwrap();
        match records.get(&request_id) {
            None => {
                records.insert(
                    request_id,
                    StoredReplay {
                        fingerprint: fingerprint.to_string(),
                        decision: None,
                    },
                );
                ReplayOutcome::Fresh
            },
            Some(stored) if stored.fingerprint != fingerprint => ReplayOutcome::Mismatch,
            Some(stored) => match &stored.decision {
                Some(decision) => ReplayOutcome::Hit(decision.clone()),
                None => ReplayOutcome::Concurrent,
            },
        }
    }

    async fn store_decision(
        &self,
        request_id: Uuid,
        fingerprint: &str,
        response: &VerifyResponse,
    ) -> Result<bool, ReplayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ReplayError::Timeout);
        }
        let mut records = self.records.lock().unwrap();
        if let Some(stored) = records.get(&request_id) {
            if stored.fingerprint != fingerprint {
                return Ok(false);
            }
        }
        records.insert(
            request_id,
            StoredReplay {
                fingerprint: fingerprint.to_string(),
                decision: Some(response.clone()),
            },
        );
        Ok(true)
    }

    async fn ping(&self) -> Result<(), ReplayError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ReplayError::Timeout)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

#[derive(Default)]
pub struct FakeRateLimiter {
    counters: Mutex<HashMap<String, u64>>,
    offline: AtomicBool,
}

impl FakeRateLimiter {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl RateLimitStore for FakeRateLimiter {
    async fn check_and_consume(
        &self,
        key: &str,
        _window: Duration,
        limit: u64,
    ) -> Result<RateLimitOutcome, RateLimitError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RateLimitError::Timeout);
        }
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count <= limit {
            Ok(RateLimitOutcome::Allowed(*count))
        } else {
            Ok(RateLimitOutcome::Exceeded(*count))
        }
    }
}

// ============================================================================
// Policy engine
// ============================================================================

pub enum PolicyBehavior {
    Allow,
    DenyWith(Vec<String>),
    Timeout,
    Unavailable,
}

pub struct FakePolicy {
    behavior: Mutex<PolicyBehavior>,
}

impl Default for FakePolicy {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(PolicyBehavior::Allow),
        }
    }
}

impl FakePolicy {
    pub fn set_behavior(&self, behavior: PolicyBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl PolicyEngine for FakePolicy {
    async fn evaluate(&self, _input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        match &*self.behavior.lock().unwrap() {
            PolicyBehavior::Allow => Ok(PolicyDecision {
                allow: true,
                violations: vec![],
            }),
            PolicyBehavior::DenyWith(violations) => Ok(PolicyDecision {
                allow: false,
                violations: violations.clone(),
            }),
            PolicyBehavior::Timeout => Err(PolicyError::Timeout),
            PolicyBehavior::Unavailable => {
                Err(PolicyError::Unavailable("connection refused".to_string()))
            },
        }
    }

    async fn ping(&self) -> Result<(), PolicyError> {
        match &*self.behavior.lock().unwrap() {
            PolicyBehavior::Timeout => Err(PolicyError::Timeout),
            PolicyBehavior::Unavailable => {
                Err(PolicyError::Unavailable("connection refused".to_string()))
            },
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Audit store
// ============================================================================

#[derive(Default)]
pub struct FakeAuditStore {
    events: Mutex<Vec<AuditEvent>>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    seq: AtomicUsize,
}

impl FakeAuditStore {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next `n` appends, then recovers.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl AuditStore for FakeAuditStore {
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent, AuditError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuditError::Pool("connection refused".to_string()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuditError::Pool("transient failure".to_string()));
        }

        let mut events = self.events.lock().unwrap();
        let prev_hash = events.last().map_or_else(String::new, |e| e.hash.clone());
        let event_id = Uuid::new_v4();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let ts = format!("2026-08-02T10:00:00.{seq:06}Z");
        let hash = compute_hash(
            &prev_hash,
            &draft.request_id,
            &event_id,
            &ts,
            &draft.actor,
            &draft.action,
            draft.decision.as_str(),
            &draft.payload,
        );
        let event = AuditEvent {
            event_id,
            request_id: draft.request_id,
            ts,
            actor: draft.actor,
            action: draft.action,
            decision: draft.decision,
            payload: draft.payload,
            prev_hash,
            hash,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn ping(&self) -> Result<(), AuditError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(AuditError::Pool("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub replay: Arc<FakeReplayStore>,
    pub limiter: Arc<FakeRateLimiter>,
    pub policy: Arc<FakePolicy>,
    pub audit: Arc<FakeAuditStore>,
    pub metrics: SharedMetricsRegistry,
    pub verifier: Verifier,
}

pub fn harness() -> Harness {
    harness_with(VerifierConfig {
        anti_replay_enabled: true,
        sms_rate_limit: 1,
        sms_rate_window: Duration::from_secs(3600),
        turn_budget: Duration::from_secs(5),
    })
}

pub fn harness_with(config: VerifierConfig) -> Harness {
    let replay = Arc::new(FakeReplayStore::default());
    let limiter = Arc::new(FakeRateLimiter::default());
    let policy = Arc::new(FakePolicy::default());
    let audit = Arc::new(FakeAuditStore::default());
    let metrics = new_shared_registry().expect("metrics registry");

    let verifier = Verifier::new(
        Arc::clone(&replay) as Arc<dyn ReplayStore>,
        Arc::clone(&limiter) as Arc<dyn RateLimitStore>,
        Arc::clone(&policy) as Arc<dyn PolicyEngine>,
        Arc::clone(&audit) as Arc<dyn AuditStore>,
        Arc::clone(&metrics),
        config,
    );

    Harness {
        replay,
        limiter,
        policy,
        audit,
        metrics,
        verifier,
    }
}

/// A well-formed request for the given coordinates with a fresh
/// `request_id`.
pub fn request(tool: &str, mode: &str, role: &str, patient: &str, tenant: &str) -> VerifyRequest {
    serde_json::from_value(json!({
        "request_id": Uuid::new_v4(),
        "tool": tool,
        "mode": mode,
        "role": role,
        "subject": {"patient_id": patient},
        "args": {},
        "context": {"tenant_id": tenant}
    }))
    .expect("well-formed request")
}
