//! HTTP surface of the gateway.
//!
//! `POST /verify` answers 200 for both ALLOW and DENY; 4xx is reserved for
//! schema-invalid bodies and 5xx for genuine server errors. Liveness
//! (`/health`) only says the process runs; readiness (`/healthz`) demands
//! that Postgres, Redis, and the policy engine all answer within their
//! per-check budget and names the first component that does not.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use casf_core::types::VerifyRequest;

use crate::audit::AuditStore;
use crate::metrics::SharedMetricsRegistry;
use crate::opa::PolicyEngine;
use crate::replay::ReplayStore;
use crate::verify::Verifier;

/// Budget per readiness probe component.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared handler state.
pub struct AppState {
    /// The decision pipeline.
    pub verifier: Verifier,
    /// Metrics registry backing `/metrics`.
    pub metrics: SharedMetricsRegistry,
    /// Audit store, probed by readiness.
    pub audit: Arc<dyn AuditStore>,
    /// Anti-replay store, probed by readiness.
    pub replay: Arc<dyn ReplayStore>,
    /// Policy engine, probed by readiness.
    pub policy: Arc<dyn PolicyEngine>,
}

/// Builds the gateway router. The metrics registry always exists (the
/// pipeline records into it); `metrics_enabled` only controls whether it
/// is exposed for scraping.
pub fn router(state: Arc<AppState>, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/verify", post(verify))
        .route("/health", get(health))
        .route("/healthz", get(healthz));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics));
    }
    router.with_state(state)
}

async fn verify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> impl IntoResponse {
    let response = state.verifier.verify(request).await;
    (StatusCode::OK, Json(response))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(err) = checked("postgres", state.audit.ping()).await {
        return err.into_response();
    }
    if let Err(err) = checked("redis", state.replay.ping()).await {
        return err.into_response();
    }
    if let Err(err) = checked("opa", state.policy.ping()).await {
        return err.into_response();
    }

    Json(json!({
        "status": "ok",
        "checks": { "postgres": "ok", "redis": "ok", "opa": "ok" }
    }))
    .into_response()
}

/// Wraps one readiness probe, naming the component on failure.
async fn checked<E: std::fmt::Display>(
    component: &'static str,
    probe: impl std::future::Future<Output = Result<(), E>>,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let failure = |detail: String| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "component": component,
                "error": detail,
            })),
        )
    };

    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(failure(err.to_string())),
        Err(_) => Err(failure("healthcheck timed out".to_string())),
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(
                "content-type",
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {err}"),
            )
                .into_response()
        },
    }
}
