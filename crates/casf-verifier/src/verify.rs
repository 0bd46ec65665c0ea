//! Decision orchestrator.
//!
//! One request turn walks ReplayCheck → Invariants → RateLimit → Policy →
//! Assemble → Audit → ReplayCacheWrite. Any stage can short-circuit to
//! DENY; the audit append happens for every terminal decision except
//! replay hits, whose original turn already produced the row.
//!
//! The posture throughout: infrastructure failure never yields ALLOW on a
//! write tool; readers tolerate a degraded policy engine or key-value
//! store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use casf_core::rules;
use casf_core::tools;
use casf_core::types::{AuditDraft, VerifyRequest, VerifyResponse, Violation};

use crate::audit::{AuditError, AuditStore};
use crate::config::Config;
use crate::metrics::{FailClosedTrigger, SharedMetricsRegistry, VerifierMetrics};
use crate::opa::{PolicyEngine, PolicyError, PolicyInput};
use crate::ratelimit::{sms_key, RateLimitError, RateLimitOutcome, RateLimitStore};
use crate::replay::{fingerprint, ReplayOutcome, ReplayStore};

/// Audit action recorded for replayed request ids with a tampered payload.
pub const REPLAY_DETECTED_ACTION: &str = "REPLAY_DETECTED";

/// Default end-to-end budget for one verification turn. Dominates the
/// per-stage budgets (two key-value calls, one policy call, one audit
/// append plus retry) with headroom.
pub const DEFAULT_TURN_BUDGET: Duration = Duration::from_secs(5);

/// Orchestrator knobs, distilled from [`Config`].
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Whether the anti-replay gate runs at all.
    pub anti_replay_enabled: bool,
    /// SMS-per-patient limit within one window.
    pub sms_rate_limit: u64,
    /// SMS rate-limit window.
    pub sms_rate_window: Duration,
    /// End-to-end deadline per request.
    pub turn_budget: Duration,
}

impl From<&Config> for VerifierConfig {
    fn from(config: &Config) -> Self {
        Self {
            anti_replay_enabled: config.anti_replay_enabled,
            sms_rate_limit: config.sms_rate_limit,
            sms_rate_window: config.sms_rate_window,
            turn_budget: DEFAULT_TURN_BUDGET,
        }
    }
}

/// Remaining time for the current turn; stages inherit what is left.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    fn remaining(self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// The synchronous decision pipeline.
pub struct Verifier {
    replay: Arc<dyn ReplayStore>,
    limiter: Arc<dyn RateLimitStore>,
    policy: Arc<dyn PolicyEngine>,
    audit: Arc<dyn AuditStore>,
    metrics: SharedMetricsRegistry,
    config: VerifierConfig,
}

impl Verifier {
    /// Wires the pipeline over its four collaborators.
    #[must_use]
    pub fn new(
        replay: Arc<dyn ReplayStore>,
        limiter: Arc<dyn RateLimitStore>,
        policy: Arc<dyn PolicyEngine>,
        audit: Arc<dyn AuditStore>,
        metrics: SharedMetricsRegistry,
        config: VerifierConfig,
    ) -> Self {
        Self {
            replay,
            limiter,
            policy,
            audit,
            metrics,
            config,
        }
    }

    fn pipeline_metrics(&self) -> &VerifierMetrics {
        self.metrics.verifier_metrics()
    }

    /// Runs one verification turn to its terminal decision.
    pub async fn verify(&self, request: VerifyRequest) -> VerifyResponse {
        let metrics = self.pipeline_metrics();
        let _guard = metrics.request_started();
        let deadline = Deadline::new(self.config.turn_budget);
        let fp = fingerprint(&request);
        let is_write = tools::is_write_tool(&request.tool);

        // ====================================================================
        // ReplayCheck
        // ====================================================================
        let mut cache_fingerprint = None;
        if self.config.anti_replay_enabled {
            let claim = self.replay.claim(request.request_id, &fp);
            let outcome = match tokio::time::timeout(deadline.remaining(), claim).await {
                Ok(outcome) => outcome,
                Err(_) => ReplayOutcome::Unavailable,
            };
            match outcome {
                ReplayOutcome::Fresh => cache_fingerprint = Some(fp.clone()),
                ReplayOutcome::Hit(cached) => {
                    debug!(request_id = %request.request_id, "idempotent replay served from cache");
                    metrics.replay_hit();
                    metrics.decision(cached.decision);
                    return cached;
                },
                ReplayOutcome::Mismatch => {
                    warn!(request_id = %request.request_id, "replayed request_id with different payload");
                    metrics.replay_mismatch();
                    let response = VerifyResponse::deny([Violation::ReplayPayloadMismatch]);
                    return self
                        .finish(&request, response, Some(REPLAY_DETECTED_ACTION), None, deadline)
                        .await;
                },
                ReplayOutcome::Concurrent => {
                    metrics.replay_concurrent();
                    let response = VerifyResponse::deny([Violation::ReplayConcurrent]);
                    return self.finish(&request, response, None, None, deadline).await;
                },
                ReplayOutcome::Unavailable => {
                    if is_write {
                        metrics.fail_closed(FailClosedTrigger::Redis);
                        let response = VerifyResponse::deny([
                            Violation::FailClosed,
                            Violation::ReplayCheckUnavailable,
                        ]);
                        return self.finish(&request, response, None, None, deadline).await;
                    }
                    // Read path continues without the gate.
                },
            }
        }

        // ====================================================================
        // Invariants
        // ====================================================================
        let mut violations = rules::evaluate(&request);
        let mut policy_tags: Vec<String> = Vec::new();

        // ====================================================================
        // RateLimit (send_sms only)
        // ====================================================================
        if violations.is_empty() && request.tool == tools::SEND_SMS {
            let sms_key_value = sms_key(&request.subject.patient_id);
            let check = self.limiter.check_and_consume(
                &sms_key_value,
                self.config.sms_rate_window,
                self.config.sms_rate_limit,
            );
            let outcome = match tokio::time::timeout(deadline.remaining(), check).await {
                Ok(result) => result,
                Err(_) => Err(RateLimitError::Timeout),
            };
            match outcome {
                Ok(RateLimitOutcome::Allowed(_)) => {},
                Ok(RateLimitOutcome::Exceeded(count)) => {
                    debug!(request_id = %request.request_id, count, "sms burst limit exceeded");
                    metrics.rate_limit_deny();
                    violations.insert(Violation::NoSmsBurst);
                },
                Err(err) => {
                    warn!(request_id = %request.request_id, error = %err, "rate limiter unavailable");
                    metrics.fail_closed(FailClosedTrigger::Rules);
                    violations.insert(Violation::FailClosed);
                    violations.insert(Violation::NoSmsBurst);
                },
            }
        }

        // ====================================================================
        // Policy
        // ====================================================================
        if violations.is_empty() {
            let input = PolicyInput::from_request(&request);
            let evaluate = self.policy.evaluate(&input);
            let result = match tokio::time::timeout(deadline.remaining(), evaluate).await {
                Ok(result) => result,
                Err(_) => Err(PolicyError::Timeout),
            };
            match result {
                Ok(decision) => {
                    if !decision.allow {
                        if decision.violations.is_empty() {
                            violations.insert(Violation::OpaDeny);
                        } else {
                            policy_tags.extend(decision.violations);
                        }
                    }
                },
                Err(err) => {
                    metrics.opa_error(err.kind());
                    if is_write {
                        warn!(request_id = %request.request_id, error = %err, "policy engine failed on write tool");
                        metrics.fail_closed(FailClosedTrigger::Opa);
                        violations.insert(Violation::FailClosed);
                        violations.insert(if err.is_timeout() {
                            Violation::OpaTimeout
                        } else {
                            Violation::OpaUnavailable
                        });
                    } else {
                        debug!(request_id = %request.request_id, error = %err, "policy engine failed; read path continues on rules alone");
                    }
                },
            }
        }

        // ====================================================================
        // Assemble
        // ====================================================================
        let response = if violations.is_empty() && policy_tags.is_empty() {
            let outputs = tools::lookup(&request.tool)
                .map(|spec| spec.outputs.iter().map(ToString::to_string).collect())
                .unwrap_or_default();
            VerifyResponse::allow(outputs)
        } else {
            VerifyResponse::deny_tags(
                violations
                    .iter()
                    .map(|v| v.as_str().to_string())
                    .chain(policy_tags),
            )
        };

        self.finish(&request, response, None, cache_fingerprint, deadline)
            .await
    }

    /// Audit append and replay cache-write: the two stages every terminal
    /// decision passes through.
    async fn finish(
        &self,
        request: &VerifyRequest,
        mut response: VerifyResponse,
        action_override: Option<&str>,
        cache_fingerprint: Option<String>,
        deadline: Deadline,
    ) -> VerifyResponse {
        let metrics = self.pipeline_metrics();

        // ====================================================================
        // Audit
        // ====================================================================
        let draft = self.draft_for(request, &response, action_override);
        if let Err(err) = self.append_within(draft, deadline).await {
            warn!(request_id = %request.request_id, error = %err, "audit append failed; rewriting decision to DENY");
            metrics.fail_closed(FailClosedTrigger::Postgres);

            let mut tags: BTreeSet<String> = response.violations.iter().cloned().collect();
            tags.insert(Violation::FailClosed.as_str().to_string());
            tags.insert(Violation::AuditUnavailable.as_str().to_string());
            response = VerifyResponse::deny_tags(tags);

            let retry = self.draft_for(request, &response, action_override);
            if let Err(err) = self.append_within(retry, deadline).await {
                error!(request_id = %request.request_id, error = %err, "audit append retry failed; decision leaves no trail");
                response.reason = format!("{} | audit_append_failed", response.reason);
            }
        }

        // ====================================================================
        // ReplayCacheWrite
        // ====================================================================
        // Errors here are logged only; the decision is already made.
        if let Some(fp) = cache_fingerprint {
            match self
                .replay
                .store_decision(request.request_id, &fp, &response)
                .await
            {
                Ok(true) => {},
                Ok(false) => {
                    warn!(request_id = %request.request_id, "replay cache write refused: stored fingerprint differs");
                },
                Err(err) => {
                    warn!(request_id = %request.request_id, error = %err, "replay cache write failed");
                },
            }
        }

        metrics.decision(response.decision);
        info!(
            request_id = %request.request_id,
            tool = %request.tool,
            decision = %response.decision,
            reason = %response.reason,
            "verification decided"
        );
        response
    }

    fn draft_for(
        &self,
        request: &VerifyRequest,
        response: &VerifyResponse,
        action_override: Option<&str>,
    ) -> AuditDraft {
        action_override.map_or_else(
            || AuditDraft::for_turn(request, response),
            |action| AuditDraft::for_turn_with_action(request, response, action),
        )
    }

    async fn append_within(&self, draft: AuditDraft, deadline: Deadline) -> Result<(), AuditError> {
        match tokio::time::timeout(deadline.remaining(), self.audit.append(draft)).await {
            Ok(Ok(_event)) => Ok(()),
            Ok(Err(err)) => Err(err),
            // The blocking append may still commit behind this timeout; the
            // writer holds the advisory lock until it resolves either way.
            Err(_) => Err(AuditError::Timeout),
        }
    }
}
