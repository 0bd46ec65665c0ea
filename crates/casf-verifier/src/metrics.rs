//! Prometheus metrics for the verification pipeline.
//!
//! All label values come from closed enums so cardinality is bounded by
//! construction. Identifiers that could carry PHI or unbounded cardinality
//! (`tenant_id`, `patient_id`, `request_id`, `tool`, `role`, `user_id`,
//! `session_id`) are never used as labels.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use thiserror::Error;

use casf_core::types::Decision;

use crate::opa::PolicyErrorKind;

/// Latency buckets for `verify_duration_seconds`.
pub const VERIFY_DURATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Which infrastructure failure forced a fail-closed denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailClosedTrigger {
    /// Key-value store (anti-replay claim) unreachable.
    Redis,
    /// Policy engine unreachable or over budget.
    Opa,
    /// Rules-stage collaborator (rate limiter) unreachable.
    Rules,
    /// Audit trail unreachable.
    Postgres,
}

impl FailClosedTrigger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Opa => "opa",
            Self::Rules => "rules",
            Self::Postgres => "postgres",
        }
    }
}

/// Verification pipeline metrics.
///
/// All metrics use interior mutability and are safe to share across tasks.
#[derive(Clone)]
pub struct VerifierMetrics {
    verify_total: IntCounter,
    verify_decision_total: IntCounterVec,
    replay_hit_total: IntCounter,
    replay_mismatch_total: IntCounter,
    replay_concurrent_total: IntCounter,
    fail_closed_total: IntCounterVec,
    rate_limit_deny_total: IntCounter,
    opa_error_total: IntCounterVec,
    verify_in_flight: IntGauge,
    verify_duration_seconds: Histogram,
}

impl VerifierMetrics {
    /// Creates the metric family set and registers it with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let verify_total = IntCounter::with_opts(Opts::new(
            "verify_total",
            "Total verification requests received",
        ))?;
        registry.register(Box::new(verify_total.clone()))?;

        let verify_decision_total = IntCounterVec::new(
            Opts::new("verify_decision_total", "Terminal decisions by outcome"),
            &["decision"],
        )?;
        registry.register(Box::new(verify_decision_total.clone()))?;

        let replay_hit_total = IntCounter::with_opts(Opts::new(
            "replay_hit_total",
            "Idempotent replays answered from the decision cache",
        ))?;
        registry.register(Box::new(replay_hit_total.clone()))?;

        let replay_mismatch_total = IntCounter::with_opts(Opts::new(
            "replay_mismatch_total",
            "Replayed request_ids with a tampered payload",
        ))?;
        registry.register(Box::new(replay_mismatch_total.clone()))?;

        let replay_concurrent_total = IntCounter::with_opts(Opts::new(
            "replay_concurrent_total",
            "Denials of request_ids already mid-flight",
        ))?;
        registry.register(Box::new(replay_concurrent_total.clone()))?;

        let fail_closed_total = IntCounterVec::new(
            Opts::new(
                "fail_closed_total",
                "Fail-closed denials by triggering component",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(fail_closed_total.clone()))?;

        let rate_limit_deny_total = IntCounter::with_opts(Opts::new(
            "rate_limit_deny_total",
            "SMS burst-limit denials",
        ))?;
        registry.register(Box::new(rate_limit_deny_total.clone()))?;

        let opa_error_total = IntCounterVec::new(
            Opts::new("opa_error_total", "Policy engine failures by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(opa_error_total.clone()))?;

        let verify_in_flight = IntGauge::with_opts(Opts::new(
            "verify_in_flight",
            "Verification requests currently being processed",
        ))?;
        registry.register(Box::new(verify_in_flight.clone()))?;

        let verify_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "verify_duration_seconds",
                "End-to-end verification latency",
            )
            .buckets(VERIFY_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(verify_duration_seconds.clone()))?;

        Ok(Self {
            verify_total,
            verify_decision_total,
            replay_hit_total,
            replay_mismatch_total,
            replay_concurrent_total,
            fail_closed_total,
            rate_limit_deny_total,
            opa_error_total,
            verify_in_flight,
            verify_duration_seconds,
        })
    }

    /// Counts an incoming request and returns a guard that tracks the
    /// in-flight gauge and latency histogram until dropped.
    #[must_use]
    pub fn request_started(&self) -> RequestGuard {
        self.verify_total.inc();
        self.verify_in_flight.inc();
        RequestGuard {
            in_flight: self.verify_in_flight.clone(),
            timer: Some(self.verify_duration_seconds.start_timer()),
        }
    }

    /// Records a terminal decision.
    pub fn decision(&self, decision: Decision) {
        self.verify_decision_total
            .with_label_values(&[decision.as_str()])
            .inc();
    }

    /// Records an idempotent replay served from cache.
    pub fn replay_hit(&self) {
        self.replay_hit_total.inc();
    }

    /// Records a replayed `request_id` with a different payload.
    pub fn replay_mismatch(&self) {
        self.replay_mismatch_total.inc();
    }

    /// Records a concurrent-pipeline denial.
    pub fn replay_concurrent(&self) {
        self.replay_concurrent_total.inc();
    }

    /// Records a fail-closed denial.
    pub fn fail_closed(&self, trigger: FailClosedTrigger) {
        self.fail_closed_total
            .with_label_values(&[trigger.as_str()])
            .inc();
    }

    /// Records an SMS burst-limit denial.
    pub fn rate_limit_deny(&self) {
        self.rate_limit_deny_total.inc();
    }

    /// Records a classified policy-engine failure.
    pub fn opa_error(&self, kind: PolicyErrorKind) {
        self.opa_error_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// Current decision count for a given outcome; test hook.
    #[must_use]
    pub fn decision_count(&self, decision: Decision) -> u64 {
        self.verify_decision_total
            .with_label_values(&[decision.as_str()])
            .get()
    }

    /// Current replay-hit count; test hook.
    #[must_use]
    pub fn replay_hit_count(&self) -> u64 {
        self.replay_hit_total.get()
    }

    /// Current fail-closed count for a trigger; test hook.
    #[must_use]
    pub fn fail_closed_count(&self, trigger: FailClosedTrigger) -> u64 {
        self.fail_closed_total
            .with_label_values(&[trigger.as_str()])
            .get()
    }

    /// Current in-flight gauge value; test hook.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.verify_in_flight.get()
    }
}

/// Guard returned by [`VerifierMetrics::request_started`].
///
/// Observes the latency histogram and decrements the in-flight gauge when
/// dropped, on every exit path.
pub struct RequestGuard {
    in_flight: IntGauge,
    timer: Option<HistogramTimer>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
        self.in_flight.dec();
    }
}

/// Registry wrapper holding the Prometheus registry and pipeline metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    verifier_metrics: VerifierMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all pipeline metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let verifier_metrics = VerifierMetrics::new(&registry)?;
        Ok(Self {
            registry,
            verifier_metrics,
        })
    }

    /// The pipeline metrics handle.
    #[must_use]
    pub const fn verifier_metrics(&self) -> &VerifierMetrics {
        &self.verifier_metrics
    }

    /// Encodes all metrics in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> Result<SharedMetricsRegistry, MetricsError> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creation_and_encoding() {
        let registry = MetricsRegistry::new().expect("registry creation should succeed");
        let text = registry.encode_text().unwrap();
        assert!(text.contains("verify_total"));
        assert!(text.contains("verify_in_flight"));
    }

    #[test]
    fn request_guard_tracks_in_flight() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.verifier_metrics();

        assert_eq!(metrics.in_flight(), 0);
        let guard = metrics.request_started();
        assert_eq!(metrics.in_flight(), 1);
        drop(guard);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn decision_counter_by_label() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.verifier_metrics();

        metrics.decision(Decision::Allow);
        metrics.decision(Decision::Deny);
        metrics.decision(Decision::Deny);
        assert_eq!(metrics.decision_count(Decision::Allow), 1);
        assert_eq!(metrics.decision_count(Decision::Deny), 2);
    }

    #[test]
    fn fail_closed_by_trigger() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.verifier_metrics();

        metrics.fail_closed(FailClosedTrigger::Redis);
        metrics.fail_closed(FailClosedTrigger::Opa);
        metrics.fail_closed(FailClosedTrigger::Opa);
        assert_eq!(metrics.fail_closed_count(FailClosedTrigger::Redis), 1);
        assert_eq!(metrics.fail_closed_count(FailClosedTrigger::Opa), 2);
        assert_eq!(metrics.fail_closed_count(FailClosedTrigger::Postgres), 0);
    }

    #[test]
    fn duration_histogram_uses_contract_buckets() {
        let registry = MetricsRegistry::new().unwrap();
        drop(registry.verifier_metrics().request_started());
        let text = registry.encode_text().unwrap();
        assert!(text.contains("verify_duration_seconds_bucket{le=\"0.005\"}"));
        assert!(text.contains("verify_duration_seconds_bucket{le=\"2.5\"}"));
    }
}
